//! The compiled, content-addressed, executable form of a configuration.
//!
//! A blueprint is created once at publish time and immutable afterwards.
//! Its canonical JSON encoding determines its [`Digest`], the identity
//! under which it is published, listed and dropped.

mod compile;

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest as _;
use sha2::Sha256;

use crate::error::CompileError;
use crate::expression::Expression;
use crate::value::DynamicValue;
use crate::value::Object;

pub use compile::compile;

/// The runtime schema plus everything execution needs per field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub schema: SchemaRoots,
    pub types: IndexMap<String, TypeDef>,
    #[serde(default, skip_serializing_if = "is_default")]
    pub server: ServerSettings,
    #[serde(default, skip_serializing_if = "is_default")]
    pub upstream: UpstreamSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaRoots {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mutation: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    /// Per-request budget in milliseconds; expiry cancels the whole tree.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timeout: Option<u64>,
    /// Server-level static variables, reachable as `{{vars.x}}`.
    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub vars: Object,
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub query_validation: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            timeout: None,
            vars: Object::default(),
            query_validation: true,
        }
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_millis)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamSettings {
    #[serde(default, skip_serializing_if = "is_default")]
    pub http_cache: bool,
    /// Inbound headers (lowercased) forwarded to upstreams and visible to
    /// `{{headers.x}}` templates.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_headers: BTreeSet<String>,
    /// Batch window length in milliseconds.
    #[serde(default, skip_serializing_if = "is_default")]
    pub batch_delay: u64,
    #[serde(default = "default_batch_size", skip_serializing_if = "is_default_batch_size")]
    pub batch_max_size: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        UpstreamSettings {
            http_cache: false,
            allowed_headers: BTreeSet::new(),
            batch_delay: 0,
            batch_max_size: default_batch_size(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub fields: IndexMap<String, FieldDef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub of_type: FieldTypeRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgDef>,
    /// Absent for plain projection fields: they read their name out of the
    /// parent value.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resolver: Option<Expression>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub batching: Option<Batching>,
    /// `@cache(maxAge)` in seconds.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cache_max_age: Option<u64>,
    /// Projects the resolved value through this path before the children
    /// see it (`select:`/`@addField`). Applied at step construction.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub inline: Option<Vec<String>>,
}

impl FieldDef {
    pub fn new(of_type: FieldTypeRef) -> FieldDef {
        FieldDef {
            of_type,
            args: Vec::new(),
            resolver: None,
            batching: None,
            cache_max_age: None,
            inline: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgDef {
    pub name: String,
    pub of_type: FieldTypeRef,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default: Option<DynamicValue>,
}

/// `groupBy`/`batchKey` batching hint of a field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batching {
    /// The query parameter whose values collapse into one upstream call.
    pub group_by: String,
    /// Path into each response element whose leaf attributes the element
    /// back to a logical caller.
    pub batch_key: Vec<String>,
    /// List-valued fields collect every matching element instead of the
    /// first.
    #[serde(default, skip_serializing_if = "is_default")]
    pub list: bool,
}

/// A reference to an output type, mirroring GraphQL's wrapping types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldTypeRef {
    Named(String),
    NonNull(Box<FieldTypeRef>),
    List(Box<FieldTypeRef>),
}

impl FieldTypeRef {
    pub fn named(name: impl Into<String>) -> FieldTypeRef {
        FieldTypeRef::Named(name.into())
    }

    pub fn non_null(self) -> FieldTypeRef {
        FieldTypeRef::NonNull(Box::new(self))
    }

    pub fn list(self) -> FieldTypeRef {
        FieldTypeRef::List(Box::new(self))
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, FieldTypeRef::NonNull(_))
    }

    /// Whether the (unwrapped) shape is a list.
    pub fn is_list(&self) -> bool {
        match self {
            FieldTypeRef::List(_) => true,
            FieldTypeRef::NonNull(inner) => inner.is_list(),
            FieldTypeRef::Named(_) => false,
        }
    }

    /// The innermost type name.
    pub fn named_type(&self) -> &str {
        match self {
            FieldTypeRef::Named(name) => name,
            FieldTypeRef::NonNull(inner) | FieldTypeRef::List(inner) => inner.named_type(),
        }
    }

    /// Parses GraphQL type syntax: `User`, `[Post]`, `[Int!]!`.
    pub fn parse(input: &str) -> Result<FieldTypeRef, CompileError> {
        let input = input.trim();
        let invalid = || CompileError::InvalidSchema(format!("invalid type syntax '{input}'"));
        if let Some(inner) = input.strip_suffix('!') {
            return Ok(FieldTypeRef::parse(inner)?.non_null());
        }
        if let Some(rest) = input.strip_prefix('[') {
            let inner = rest.strip_suffix(']').ok_or_else(invalid)?;
            return Ok(FieldTypeRef::parse(inner)?.list());
        }
        if input.is_empty() || !input.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(invalid());
        }
        Ok(FieldTypeRef::named(input))
    }

    pub fn is_builtin_scalar(name: &str) -> bool {
        matches!(name, "String" | "Int" | "Float" | "Boolean" | "ID")
    }
}

impl fmt::Display for FieldTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldTypeRef::Named(name) => f.write_str(name),
            FieldTypeRef::NonNull(inner) => write!(f, "{inner}!"),
            FieldTypeRef::List(inner) => write!(f, "[{inner}]"),
        }
    }
}

/// The blueprint's content address: SHA-256 over its canonical JSON form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub hex: String,
    pub alg: String,
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl Blueprint {
    /// Every type referenced by a field must exist; object types must not
    /// be empty (GraphQL forbids fieldless types).
    pub fn validate(&self) -> Result<(), CompileError> {
        if !self.types.contains_key(&self.schema.query) {
            return Err(CompileError::MissingQueryRoot(self.schema.query.clone()));
        }
        if let Some(mutation) = &self.schema.mutation {
            if !self.types.contains_key(mutation) {
                return Err(CompileError::MissingQueryRoot(mutation.clone()));
            }
        }
        for (type_name, type_def) in &self.types {
            if type_def.fields.is_empty() {
                return Err(CompileError::InvalidSchema(format!(
                    "type '{type_name}' has no fields"
                )));
            }
            for (field_name, field) in &type_def.fields {
                let reference = field.of_type.named_type();
                if !FieldTypeRef::is_builtin_scalar(reference)
                    && !self.types.contains_key(reference)
                {
                    return Err(CompileError::UnknownType {
                        reference: reference.to_string(),
                        location: format!("{type_name}.{field_name}"),
                    });
                }
                for arg in &field.args {
                    let reference = arg.of_type.named_type();
                    if !FieldTypeRef::is_builtin_scalar(reference) {
                        return Err(CompileError::UnknownType {
                            reference: reference.to_string(),
                            location: format!("{type_name}.{field_name}({})", arg.name),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Renders the public SDL used to validate inbound documents.
    pub fn to_sdl(&self) -> String {
        let mut sdl = String::new();
        sdl.push_str("schema {\n");
        sdl.push_str(&format!("  query: {}\n", self.schema.query));
        if let Some(mutation) = &self.schema.mutation {
            sdl.push_str(&format!("  mutation: {mutation}\n"));
        }
        sdl.push_str("}\n");
        for (type_name, type_def) in &self.types {
            sdl.push_str(&format!("\ntype {type_name} {{\n"));
            for (field_name, field) in &type_def.fields {
                sdl.push_str("  ");
                sdl.push_str(field_name);
                if !field.args.is_empty() {
                    let rendered: Vec<String> = field
                        .args
                        .iter()
                        .map(|arg| {
                            let mut s = format!("{}: {}", arg.name, arg.of_type);
                            if let Some(default) = &arg.default {
                                s.push_str(&format!(" = {}", sdl_literal(default)));
                            }
                            s
                        })
                        .collect();
                    sdl.push_str(&format!("({})", rendered.join(", ")));
                }
                sdl.push_str(&format!(": {}\n", field.of_type));
            }
            sdl.push_str("}\n");
        }
        sdl
    }

    /// SHA-256 of the canonical JSON encoding (object keys sorted
    /// recursively).
    pub fn digest(&self) -> Digest {
        let value = serde_json::to_value(self).expect("blueprints always serialize; qed");
        let mut canonical = String::new();
        canonical_json(&value, &mut canonical);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Digest {
            hex: hex::encode(hasher.finalize()),
            alg: "SHA-256".to_string(),
        }
    }
}

/// Renders a default value as a GraphQL literal for the SDL.
fn sdl_literal(value: &DynamicValue) -> String {
    match value {
        DynamicValue::Null => "null".to_string(),
        DynamicValue::Bool(b) => b.to_string(),
        DynamicValue::Int(i) => i.to_string(),
        DynamicValue::Float(f) => f.to_string(),
        DynamicValue::Enum { name, .. } => name.clone(),
        other => serde_json::Value::from(other.clone()).to_string(),
    }
}

fn canonical_json(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by_key(|(key, _)| *key);
            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                canonical_json(value, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn default_batch_size() -> usize {
    100
}

fn is_default_batch_size(value: &usize) -> bool {
    *value == default_batch_size()
}

fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::expression::Expression;

    fn sample() -> Blueprint {
        let mut user = TypeDef::default();
        user.fields.insert(
            "id".to_string(),
            FieldDef::new(FieldTypeRef::named("Int").non_null()),
        );
        user.fields.insert(
            "friends".to_string(),
            FieldDef::new(FieldTypeRef::named("User").list()),
        );

        let mut query = TypeDef::default();
        let mut user_field = FieldDef::new(FieldTypeRef::named("User"));
        user_field.args.push(ArgDef {
            name: "id".to_string(),
            of_type: FieldTypeRef::named("Int").non_null(),
            default: None,
        });
        user_field.resolver = Some(Expression::Identity);
        query.fields.insert("user".to_string(), user_field);

        Blueprint {
            schema: SchemaRoots {
                query: "Query".to_string(),
                mutation: None,
            },
            types: [("Query".to_string(), query), ("User".to_string(), user)]
                .into_iter()
                .collect(),
            server: ServerSettings::default(),
            upstream: UpstreamSettings::default(),
        }
    }

    #[test]
    fn recursive_types_validate() {
        sample().validate().unwrap();
    }

    #[test]
    fn unknown_references_are_rejected() {
        let mut blueprint = sample();
        blueprint
            .types
            .get_mut("User")
            .unwrap()
            .fields
            .insert(
                "company".to_string(),
                FieldDef::new(FieldTypeRef::named("Company")),
            );
        assert!(matches!(
            blueprint.validate(),
            Err(CompileError::UnknownType { .. })
        ));
    }

    #[test]
    fn sdl_renders_wrapping_types_and_args() {
        let sdl = sample().to_sdl();
        assert!(sdl.contains("schema {\n  query: Query\n}"));
        assert!(sdl.contains("user(id: Int!): User"));
        assert!(sdl.contains("friends: [User]"));
        apollo_compiler::Schema::parse_and_validate(sdl.as_str(), "blueprint.graphql").unwrap();
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = sample().digest();
        let b = sample().digest();
        assert_eq!(a, b);
        assert_eq!(a.alg, "SHA-256");
        assert_eq!(a.hex.len(), 64);

        let mut changed = sample();
        changed.server.timeout = Some(5_000);
        assert_ne!(changed.digest().hex, a.hex);
    }

    #[test]
    fn blueprint_encoding_round_trips() {
        let blueprint = sample();
        let encoded = serde_json::to_string(&blueprint).unwrap();
        let decoded: Blueprint = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, blueprint);
        assert_eq!(decoded.digest(), blueprint.digest());
    }

    #[test]
    fn type_ref_parse_round_trips() {
        for syntax in ["User", "[Post]", "[Int!]!", "String!"] {
            assert_eq!(FieldTypeRef::parse(syntax).unwrap().to_string(), syntax);
        }
        assert!(FieldTypeRef::parse("[User").is_err());
        assert!(FieldTypeRef::parse("").is_err());
    }
}
