//! Structural type descriptors used to validate and shape dynamic values.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::DynamicValue;

/// A structural type. Subtyping is width-covariant: an object is a subtype
/// of another when it provides (at least) every field the other declares,
/// each at a subtype.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TSchema {
    Str,
    Int,
    Bool,
    Opt(Box<TSchema>),
    Arr(Box<TSchema>),
    Dict(Box<TSchema>),
    Obj(BTreeMap<String, TSchema>),
}

impl TSchema {
    pub fn opt(inner: TSchema) -> TSchema {
        TSchema::Opt(Box::new(inner))
    }

    pub fn arr(inner: TSchema) -> TSchema {
        TSchema::Arr(Box::new(inner))
    }

    pub fn dict(inner: TSchema) -> TSchema {
        TSchema::Dict(Box::new(inner))
    }

    pub fn obj<const N: usize>(fields: [(&str, TSchema); N]) -> TSchema {
        TSchema::Obj(
            fields
                .into_iter()
                .map(|(name, schema)| (name.to_string(), schema))
                .collect(),
        )
    }

    /// Checks that `value` structurally matches this schema. Extra object
    /// fields are permitted (width subtyping); missing declared fields are
    /// not, unless the field type is optional.
    pub fn validate(&self, value: &DynamicValue) -> Result<(), Vec<String>> {
        let mut failures = Vec::new();
        self.validate_at("", value, &mut failures);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures)
        }
    }

    fn validate_at(&self, path: &str, value: &DynamicValue, failures: &mut Vec<String>) {
        match (self, value) {
            (TSchema::Str, DynamicValue::String(_)) => {}
            (TSchema::Int, DynamicValue::Int(_)) => {}
            (TSchema::Bool, DynamicValue::Bool(_)) => {}
            (TSchema::Opt(_), DynamicValue::Null) => {}
            (TSchema::Opt(inner), value) => inner.validate_at(path, value, failures),
            (TSchema::Arr(inner), DynamicValue::List(items)) => {
                for (index, item) in items.iter().enumerate() {
                    inner.validate_at(&format!("{path}/{index}"), item, failures);
                }
            }
            (TSchema::Dict(inner), DynamicValue::Object(map)) => {
                for (key, item) in map {
                    inner.validate_at(&format!("{path}/{key}"), item, failures);
                }
            }
            (TSchema::Obj(fields), DynamicValue::Object(map)) => {
                for (name, schema) in fields {
                    match map.get(name) {
                        Some(item) => {
                            schema.validate_at(&format!("{path}/{name}"), item, failures)
                        }
                        None if matches!(schema, TSchema::Opt(_)) => {}
                        None => failures.push(format!("{path}/{name}: missing field")),
                    }
                }
            }
            (expected, actual) => {
                failures.push(format!("{path}: expected {expected:?}, got {actual:?}"))
            }
        }
    }

    /// Structural, width-covariant subtyping. Reflexive; `T ≤ Opt(T)`.
    pub fn is_subtype_of(&self, other: &TSchema) -> bool {
        match (self, other) {
            (TSchema::Str, TSchema::Str)
            | (TSchema::Int, TSchema::Int)
            | (TSchema::Bool, TSchema::Bool) => true,
            (TSchema::Opt(a), TSchema::Opt(b)) => a.is_subtype_of(b),
            (a, TSchema::Opt(b)) => a.is_subtype_of(b),
            (TSchema::Arr(a), TSchema::Arr(b)) => a.is_subtype_of(b),
            (TSchema::Dict(a), TSchema::Dict(b)) => a.is_subtype_of(b),
            (TSchema::Obj(a), TSchema::Obj(b)) => b.iter().all(|(name, b_field)| {
                a.get(name)
                    .map(|a_field| a_field.is_subtype_of(b_field))
                    .unwrap_or(false)
            }),
            _ => false,
        }
    }
}
