//! The operator-facing configuration surface.
//!
//! JSON and YAML decode to the same [`Config`]; encoding is the inverse
//! after `compress` normalization, which the serde attributes implement:
//! unset and default-valued options never serialize, so
//! `encode(decode(x))` is the compressed form of `x`.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

use crate::endpoint::Method;
use crate::value::DynamicValue;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default, skip_serializing_if = "is_default")]
    pub server: Server,
    #[serde(default, skip_serializing_if = "is_default")]
    pub upstream: Upstream,
    #[serde(default, skip_serializing_if = "is_default")]
    pub schema: RootSchema,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub types: IndexMap<String, Type>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Server {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hostname: Option<String>,
    /// Static variables reachable from every resolver as `{{vars.x}}`.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub vars: BTreeMap<String, String>,
    /// Per-request timeout in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub query_validation: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Upstream {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub http_cache: Option<bool>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub allowed_headers: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub batch: Option<Batch>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Batch {
    /// Batch window length in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub delay: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_size: Option<usize>,
    /// Headers that become part of a batch window's identity.
    #[serde(skip_serializing_if = "BTreeSet::is_empty", default)]
    pub headers: BTreeSet<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RootSchema {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mutation: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Type {
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub fields: IndexMap<String, Field>,
    /// `@addField(name, path)`: public fields projected out of this
    /// type's value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added_fields: Vec<AddField>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Field {
    #[serde(rename = "type")]
    pub type_of: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, Arg>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub http: Option<Http>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub graphql: Option<GraphQL>,
    /// `@const(data)`.
    #[serde(rename = "const", skip_serializing_if = "Option::is_none", default)]
    pub const_value: Option<DynamicValue>,
    /// `@expr(body)`: a JSON-encoded resolver expression.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expr: Option<DynamicValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub modify: Option<Modify>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache: Option<Cache>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Arg {
    #[serde(rename = "type")]
    pub type_of: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default: Option<DynamicValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Http {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub method: Option<Method>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub query: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<KeyValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_key: Vec<String>,
    /// Hoists a sub-value to the field's value, e.g. `"{{.company}}"`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub select: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphQL {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub url: Option<String>,
    /// The upstream field to query.
    pub name: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<KeyValue>,
    #[serde(default, skip_serializing_if = "is_default")]
    pub batch: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Modify {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub omit: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Cache {
    /// Seconds the resolved value stays fresh.
    pub max_age: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddField {
    pub name: String,
    #[serde(rename = "type")]
    pub type_of: String,
    pub path: Vec<String>,
}

impl Config {
    pub fn from_json(input: &str) -> Result<Config, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn from_yaml(input: &str) -> Result<Config, serde_yaml::Error> {
        serde_yaml::from_str(input)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"{
        "server": {"port": 8000, "vars": {"apiKey": "k"}},
        "upstream": {
            "baseUrl": "http://jsonplaceholder.typicode.com",
            "httpCache": true,
            "batch": {"delay": 10, "maxSize": 100}
        },
        "schema": {"query": "Query"},
        "types": {
            "Query": {
                "fields": {
                    "user": {
                        "type": "User",
                        "args": {"id": {"type": "Int!"}},
                        "http": {"path": "/users/{{args.id}}"}
                    }
                }
            },
            "User": {
                "fields": {
                    "id": {"type": "Int!"},
                    "name": {"type": "String"}
                }
            }
        }
    }"#;

    #[test]
    fn json_decodes() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.server.port, Some(8000));
        assert_eq!(
            config.types["Query"].fields["user"]
                .http
                .as_ref()
                .unwrap()
                .path,
            "/users/{{args.id}}"
        );
    }

    #[test]
    fn json_round_trips_after_compress() {
        let config = Config::from_json(SAMPLE).unwrap();
        let encoded = config.to_json().unwrap();
        assert_eq!(Config::from_json(&encoded).unwrap(), config);
    }

    #[test]
    fn yaml_and_json_decode_to_the_same_config() {
        let config = Config::from_json(SAMPLE).unwrap();
        let yaml = config.to_yaml().unwrap();
        assert_eq!(Config::from_yaml(&yaml).unwrap(), config);
    }

    #[test]
    fn compress_removes_default_valued_options() {
        let verbose = r#"{
            "server": {},
            "upstream": {"allowedHeaders": []},
            "schema": {},
            "types": {"Query": {"fields": {"ok": {"type": "Boolean", "const": true}}}}
        }"#;
        let encoded = Config::from_json(verbose).unwrap().to_json().unwrap();
        assert!(!encoded.contains("server"));
        assert!(!encoded.contains("allowedHeaders"));
        assert!(!encoded.contains("modify"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_json(r#"{"serverr": {}}"#).is_err());
    }
}
