//! Compiles a [`Config`] into an executable [`Blueprint`].
//!
//! All configuration problems surface here, once, at publish/check time;
//! nothing in this module runs per request.

use indexmap::IndexMap;

use super::ArgDef;
use super::Batching;
use super::Blueprint;
use super::FieldDef;
use super::FieldTypeRef;
use super::SchemaRoots;
use super::ServerSettings;
use super::TypeDef;
use super::UpstreamSettings;
use crate::config;
use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::CompileError;
use crate::expression::Expression;
use crate::expression::GraphQLCall;
use crate::expression::Unsafe;
use crate::template::Template;
use crate::value::DynamicValue;
use crate::value::Object;

pub fn compile(config: &Config) -> Result<Blueprint, CompileError> {
    let server = ServerSettings {
        timeout: config.server.timeout,
        vars: config
            .server
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), DynamicValue::from(v.as_str())))
            .collect::<Object>(),
        query_validation: config.server.query_validation.unwrap_or(true),
    };
    let batch = config.upstream.batch.clone().unwrap_or_default();
    let upstream = UpstreamSettings {
        http_cache: config.upstream.http_cache.unwrap_or(false),
        allowed_headers: config
            .upstream
            .allowed_headers
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect(),
        batch_delay: batch.delay.unwrap_or(0),
        batch_max_size: batch.max_size.unwrap_or(100),
    };

    let mut cache_tags = 0_u64;
    let mut types = IndexMap::with_capacity(config.types.len());
    for (type_name, type_config) in &config.types {
        let mut type_def = TypeDef::default();
        for (field_name, field_config) in &type_config.fields {
            if let Some(modify) = &field_config.modify {
                if modify.omit.unwrap_or(false) {
                    continue;
                }
            }
            let public_name = field_config
                .modify
                .as_ref()
                .and_then(|m| m.name.clone())
                .unwrap_or_else(|| field_name.clone());
            let field = compile_field(
                config,
                type_name,
                field_name,
                field_config,
                &mut cache_tags,
            )?;
            type_def.fields.insert(public_name, field);
        }
        for added in &type_config.added_fields {
            let mut field = FieldDef::new(parse_type(type_name, &added.name, &added.type_of)?);
            field.inline = Some(added.path.clone());
            type_def.fields.insert(added.name.clone(), field);
        }
        types.insert(type_name.clone(), type_def);
    }

    let blueprint = Blueprint {
        schema: SchemaRoots {
            query: config
                .schema
                .query
                .clone()
                .unwrap_or_else(|| "Query".to_string()),
            mutation: config.schema.mutation.clone(),
        },
        types,
        server,
        upstream,
    };
    blueprint.validate()?;
    Ok(blueprint)
}

fn compile_field(
    config: &Config,
    type_name: &str,
    field_name: &str,
    field_config: &config::Field,
    cache_tags: &mut u64,
) -> Result<FieldDef, CompileError> {
    let invalid = |reason: String| CompileError::InvalidField {
        type_name: type_name.to_string(),
        field: field_name.to_string(),
        reason,
    };

    let of_type = parse_type(type_name, field_name, &field_config.type_of)?;
    let mut field = FieldDef::new(of_type);

    for (arg_name, arg) in &field_config.args {
        field.args.push(ArgDef {
            name: arg_name.clone(),
            of_type: parse_type(type_name, field_name, &arg.type_of)?,
            default: arg.default.clone(),
        });
    }

    let resolver_count = [
        field_config.http.is_some(),
        field_config.graphql.is_some(),
        field_config.const_value.is_some(),
        field_config.expr.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if resolver_count > 1 {
        return Err(invalid("more than one resolver directive".to_string()));
    }

    let mut resolver = None;
    if let Some(http) = &field_config.http {
        let (endpoint, batching) = compile_http(config, http, &field.of_type, &invalid)?;
        field.batching = batching.clone();
        if let Some(select) = &http.select {
            field.inline = Some(parse_select(select));
        }
        resolver = Some(Expression::Unsafe(Unsafe::Http { endpoint, batching }));
    } else if let Some(graphql) = &field_config.graphql {
        resolver = Some(Expression::Unsafe(Unsafe::GraphQL(compile_graphql(
            config, graphql, &invalid,
        )?)));
    } else if let Some(value) = &field_config.const_value {
        resolver = Some(Expression::literal(value.clone()));
    } else if let Some(body) = &field_config.expr {
        let expr: Expression = serde_json::from_value(serde_json::Value::from(body.clone()))
            .map_err(|e| invalid(format!("invalid expression body: {e}")))?;
        resolver = Some(expr);
    }

    if let Some(cache) = &field_config.cache {
        if let Some(inner) = resolver.take() {
            *cache_tags += 1;
            resolver = Some(Expression::Cache {
                tag: *cache_tags,
                max_age: cache.max_age,
                inner: Box::new(inner),
            });
        }
    }
    field.cache_max_age = field_config.cache.as_ref().map(|cache| cache.max_age);
    field.resolver = resolver;
    Ok(field)
}

fn compile_http(
    config: &Config,
    http: &config::Http,
    of_type: &FieldTypeRef,
    invalid: &impl Fn(String) -> CompileError,
) -> Result<(Endpoint, Option<Batching>), CompileError> {
    let base_url = http
        .base_url
        .as_ref()
        .or(config.upstream.base_url.as_ref())
        .ok_or_else(|| invalid("no base URL (field or upstream)".to_string()))?;
    let base = Endpoint::from_url(base_url).map_err(|e| CompileError::InvalidBaseUrl {
        url: base_url.clone(),
        reason: e.to_string(),
    })?;

    let joined_path = format!(
        "{}{}",
        base.path.to_string().trim_end_matches('/'),
        http.path
    );
    let mut endpoint = base;
    endpoint.method = http.method.unwrap_or_default();
    endpoint.path = Template::parse(&joined_path);
    endpoint
        .query
        .extend(http.query.iter().map(|kv| {
            (kv.key.clone(), Template::parse(&kv.value))
        }));
    endpoint.headers = http
        .headers
        .iter()
        .map(|kv| (kv.key.clone(), Template::parse(&kv.value)))
        .collect();
    endpoint.body = http.body.as_deref().map(Template::parse);

    let batching = match http.group_by.last() {
        Some(group_key) => {
            // Group keys are reserved: a user-supplied query parameter of
            // the same name would make attribution ambiguous.
            if http.query.iter().any(|kv| kv.key == *group_key) {
                return Err(invalid(format!(
                    "query parameter '{group_key}' collides with groupBy; group keys are reserved"
                )));
            }
            Some(Batching {
                group_by: group_key.clone(),
                batch_key: if http.batch_key.is_empty() {
                    http.group_by.clone()
                } else {
                    http.batch_key.clone()
                },
                list: of_type.is_list(),
            })
        }
        None => None,
    };

    Ok((endpoint, batching))
}

fn compile_graphql(
    config: &Config,
    graphql: &config::GraphQL,
    invalid: &impl Fn(String) -> CompileError,
) -> Result<GraphQLCall, CompileError> {
    let url = graphql
        .url
        .as_ref()
        .or(config.upstream.base_url.as_ref())
        .ok_or_else(|| invalid("no upstream URL for the GraphQL call".to_string()))?;
    let url = url::Url::parse(url).map_err(|e| CompileError::InvalidBaseUrl {
        url: url.clone(),
        reason: e.to_string(),
    })?;
    Ok(GraphQLCall {
        url,
        field: graphql.name.clone(),
        args: graphql
            .args
            .iter()
            .map(|(name, value)| (name.clone(), Template::parse(value)))
            .collect(),
        headers: graphql
            .headers
            .iter()
            .map(|kv| (kv.key.clone(), Template::parse(&kv.value)))
            .collect(),
        batch: graphql.batch,
    })
}

fn parse_type(
    type_name: &str,
    field_name: &str,
    syntax: &str,
) -> Result<FieldTypeRef, CompileError> {
    FieldTypeRef::parse(syntax).map_err(|_| CompileError::InvalidField {
        type_name: type_name.to_string(),
        field: field_name.to_string(),
        reason: format!("invalid type syntax '{syntax}'"),
    })
}

/// `select` paths come in several spellings: `{{.company}}`, `.company`,
/// `company.name`. All reduce to a dotted path.
fn parse_select(select: &str) -> Vec<String> {
    select
        .trim()
        .trim_start_matches("{{")
        .trim_end_matches("}}")
        .trim()
        .trim_start_matches('.')
        .split('.')
        .map(|part| part.trim().to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_config() -> Config {
        Config::from_json(
            r#"{
            "server": {"timeout": 5000, "vars": {"region": "eu"}},
            "upstream": {
                "baseUrl": "http://jsonplaceholder.typicode.com",
                "httpCache": true,
                "allowedHeaders": ["Authorization"],
                "batch": {"delay": 10}
            },
            "types": {
                "Query": {
                    "fields": {
                        "foos": {"type": "[Foo]", "http": {"path": "/foos"}},
                        "secret": {"type": "String", "const": "s", "modify": {"omit": true}},
                        "renamed": {"type": "String", "const": "x", "modify": {"name": "visible"}}
                    }
                },
                "Foo": {
                    "fields": {
                        "id": {"type": "Int!"},
                        "bar": {
                            "type": "Bar",
                            "http": {
                                "path": "/bars",
                                "query": [{"key": "fooId", "value": "{{value.id}}"}],
                                "groupBy": ["fooId"]
                            }
                        }
                    },
                    "addedFields": [{"name": "companyName", "type": "String", "path": ["company", "name"]}]
                },
                "Bar": {
                    "fields": {
                        "id": {"type": "Int!"},
                        "fooId": {"type": "Int!"}
                    }
                }
            }
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn compiles_endpoints_batching_and_settings() {
        let blueprint = compile(&sample_config()).unwrap();
        assert_eq!(blueprint.schema.query, "Query");
        assert_eq!(blueprint.server.timeout, Some(5000));
        assert!(blueprint.upstream.http_cache);
        assert!(blueprint.upstream.allowed_headers.contains("authorization"));
        assert_eq!(blueprint.upstream.batch_delay, 10);

        let bar = &blueprint.types["Foo"].fields["bar"];
        let batching = bar.batching.as_ref().unwrap();
        assert_eq!(batching.group_by, "fooId");
        assert_eq!(batching.batch_key, vec!["fooId".to_string()]);
        assert!(!batching.list);
        match bar.resolver.as_ref().unwrap() {
            Expression::Unsafe(Unsafe::Http { endpoint, batching }) => {
                assert_eq!(endpoint.host, "jsonplaceholder.typicode.com");
                assert_eq!(endpoint.path.to_string(), "/bars");
                assert!(batching.is_some());
            }
            other => panic!("expected an HTTP resolver, got {other:?}"),
        }
    }

    #[test]
    fn group_keys_are_reserved() {
        let mut config = sample_config();
        let bar = config
            .types
            .get_mut("Foo")
            .unwrap()
            .fields
            .get_mut("bar")
            .unwrap();
        bar.http.as_mut().unwrap().query.push(config::KeyValue {
            key: "fooId".to_string(),
            value: "7".to_string(),
        });
        match compile(&config) {
            Err(CompileError::InvalidField { reason, .. }) => {
                assert!(reason.contains("reserved"))
            }
            other => panic!("expected a compile error, got {other:?}"),
        }
    }

    #[test]
    fn modify_renames_and_omits() {
        let blueprint = compile(&sample_config()).unwrap();
        let query = &blueprint.types["Query"];
        assert!(query.fields.contains_key("visible"));
        assert!(!query.fields.contains_key("renamed"));
        assert!(!query.fields.contains_key("secret"));
    }

    #[test]
    fn added_fields_project_paths() {
        let blueprint = compile(&sample_config()).unwrap();
        let added = &blueprint.types["Foo"].fields["companyName"];
        assert!(added.resolver.is_none());
        assert_eq!(
            added.inline,
            Some(vec!["company".to_string(), "name".to_string()])
        );
    }

    #[test]
    fn list_fields_batch_as_lists() {
        let mut config = sample_config();
        let bar = config
            .types
            .get_mut("Foo")
            .unwrap()
            .fields
            .get_mut("bar")
            .unwrap();
        bar.type_of = "[Bar]".to_string();
        let blueprint = compile(&config).unwrap();
        assert!(blueprint.types["Foo"].fields["bar"]
            .batching
            .as_ref()
            .unwrap()
            .list);
    }

    #[test]
    fn missing_base_url_is_a_compile_error() {
        let mut config = sample_config();
        config.upstream.base_url = None;
        assert!(matches!(
            compile(&config),
            Err(CompileError::InvalidField { .. })
        ));
    }

    #[test]
    fn select_spellings_normalize() {
        assert_eq!(parse_select("{{.company}}"), vec!["company".to_string()]);
        assert_eq!(parse_select(".company"), vec!["company".to_string()]);
        assert_eq!(
            parse_select("company.name"),
            vec!["company".to_string(), "name".to_string()]
        );
    }

    #[test]
    fn cache_directive_wraps_the_resolver() {
        let mut config = sample_config();
        let foos = config
            .types
            .get_mut("Query")
            .unwrap()
            .fields
            .get_mut("foos")
            .unwrap();
        foos.cache = Some(config::Cache { max_age: 30 });
        let blueprint = compile(&config).unwrap();
        match blueprint.types["Query"].fields["foos"].resolver.as_ref() {
            Some(Expression::Cache { max_age, .. }) => assert_eq!(*max_age, 30),
            other => panic!("expected a cache wrapper, got {other:?}"),
        }
    }
}
