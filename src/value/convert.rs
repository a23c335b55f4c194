//! Transcoders between [`DynamicValue`] and the JSON representations used
//! at the crate's edges: `serde_json` for upstream bodies and config,
//! `serde_json_bytes` for GraphQL response data.
//!
//! The JSON-representable subset (primitives, sequences, records and
//! optional values thereof) round-trips exactly. Binary payloads encode as
//! byte sequences and tagged constructors as single-entry mappings; neither
//! is produced by decoding.

use std::fmt;

use serde::de;
use serde::de::Deserializer;
use serde::de::MapAccess;
use serde::de::SeqAccess;
use serde::ser::SerializeMap;
use serde::Deserialize;
use serde::Serialize;
use serde::Serializer;

use super::DynamicValue;
use super::Object;

/// Builds a [`DynamicValue`](crate::DynamicValue) from JSON-ish literal
/// syntax, mirroring `serde_json::json!`.
#[macro_export]
macro_rules! dynamic {
    ($($json:tt)+) => {
        $crate::DynamicValue::from(serde_json::json!($($json)+))
    };
}

impl From<serde_json::Value> for DynamicValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => DynamicValue::Null,
            serde_json::Value::Bool(b) => DynamicValue::Bool(b),
            serde_json::Value::Number(n) => number_to_dynamic(&n),
            serde_json::Value::String(s) => DynamicValue::String(s),
            serde_json::Value::Array(items) => {
                DynamicValue::List(items.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => DynamicValue::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<DynamicValue> for serde_json::Value {
    fn from(value: DynamicValue) -> Self {
        match value {
            DynamicValue::Null => serde_json::Value::Null,
            DynamicValue::Bool(b) => serde_json::Value::Bool(b),
            DynamicValue::Int(i) => serde_json::Value::from(i),
            DynamicValue::Float(f) => {
                serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, Into::into)
            }
            DynamicValue::String(s) => serde_json::Value::String(s),
            DynamicValue::Binary(bytes) => {
                serde_json::Value::Array(bytes.iter().map(|b| (*b).into()).collect())
            }
            DynamicValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            DynamicValue::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
            DynamicValue::Enum { name, value } => {
                let mut map = serde_json::Map::new();
                map.insert(name, serde_json::Value::from(*value));
                serde_json::Value::Object(map)
            }
        }
    }
}

impl From<serde_json_bytes::Value> for DynamicValue {
    fn from(value: serde_json_bytes::Value) -> Self {
        match value {
            serde_json_bytes::Value::Null => DynamicValue::Null,
            serde_json_bytes::Value::Bool(b) => DynamicValue::Bool(b),
            serde_json_bytes::Value::Number(n) => number_to_dynamic(&n),
            serde_json_bytes::Value::String(s) => DynamicValue::String(s.as_str().to_string()),
            serde_json_bytes::Value::Array(items) => {
                DynamicValue::List(items.into_iter().map(Into::into).collect())
            }
            serde_json_bytes::Value::Object(map) => DynamicValue::Object(
                map.into_iter()
                    .map(|(k, v)| (k.as_str().to_string(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl From<DynamicValue> for serde_json_bytes::Value {
    fn from(value: DynamicValue) -> Self {
        match value {
            DynamicValue::Null => serde_json_bytes::Value::Null,
            DynamicValue::Bool(b) => serde_json_bytes::Value::Bool(b),
            DynamicValue::Int(i) => serde_json_bytes::Value::Number(i.into()),
            DynamicValue::Float(f) => serde_json::Number::from_f64(f)
                .map_or(serde_json_bytes::Value::Null, serde_json_bytes::Value::Number),
            DynamicValue::String(s) => serde_json_bytes::Value::String(s.into()),
            DynamicValue::Binary(bytes) => serde_json_bytes::Value::Array(
                bytes
                    .iter()
                    .map(|b| serde_json_bytes::Value::Number((*b as i64).into()))
                    .collect(),
            ),
            DynamicValue::List(items) => {
                serde_json_bytes::Value::Array(items.into_iter().map(Into::into).collect())
            }
            DynamicValue::Object(map) => serde_json_bytes::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k.into(), serde_json_bytes::Value::from(v)))
                    .collect(),
            ),
            // GraphQL responses serialize an enum value as its name.
            DynamicValue::Enum { name, .. } => serde_json_bytes::Value::String(name.into()),
        }
    }
}

fn number_to_dynamic(n: &serde_json::Number) -> DynamicValue {
    if let Some(i) = n.as_i64() {
        DynamicValue::Int(i)
    } else if let Some(u) = n.as_u64() {
        // Out of i64 range; widen rather than truncate.
        DynamicValue::Float(u as f64)
    } else {
        DynamicValue::Float(n.as_f64().unwrap_or_default())
    }
}

impl DynamicValue {
    /// Decodes a JSON document.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encodes to a JSON byte vector.
    pub fn to_json_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Serialize for DynamicValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DynamicValue::Null => serializer.serialize_unit(),
            DynamicValue::Bool(b) => serializer.serialize_bool(*b),
            DynamicValue::Int(i) => serializer.serialize_i64(*i),
            DynamicValue::Float(f) => serializer.serialize_f64(*f),
            DynamicValue::String(s) => serializer.serialize_str(s),
            DynamicValue::Binary(bytes) => serializer.collect_seq(bytes.iter()),
            DynamicValue::List(items) => serializer.collect_seq(items),
            DynamicValue::Object(map) => serializer.collect_map(map),
            DynamicValue::Enum { name, value } => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(name, value)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for DynamicValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> de::Visitor<'de> for ValueVisitor {
            type Value = DynamicValue;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("any JSON value")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(DynamicValue::Null)
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(DynamicValue::Null)
            }

            fn visit_some<D: Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> Result<Self::Value, D::Error> {
                deserializer.deserialize_any(ValueVisitor)
            }

            fn visit_bool<E>(self, b: bool) -> Result<Self::Value, E> {
                Ok(DynamicValue::Bool(b))
            }

            fn visit_i64<E>(self, i: i64) -> Result<Self::Value, E> {
                Ok(DynamicValue::Int(i))
            }

            fn visit_u64<E>(self, u: u64) -> Result<Self::Value, E> {
                Ok(i64::try_from(u)
                    .map(DynamicValue::Int)
                    .unwrap_or(DynamicValue::Float(u as f64)))
            }

            fn visit_f64<E>(self, f: f64) -> Result<Self::Value, E> {
                Ok(DynamicValue::Float(f))
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E> {
                Ok(DynamicValue::String(s.to_string()))
            }

            fn visit_string<E>(self, s: String) -> Result<Self::Value, E> {
                Ok(DynamicValue::String(s))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(DynamicValue::List(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = Object::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, DynamicValue>()? {
                    map.insert(key, value);
                }
                Ok(DynamicValue::Object(map))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dynamic;

    #[test]
    fn json_round_trip() {
        let value = dynamic!({
            "id": 1,
            "name": "Leanne",
            "score": 1.5,
            "active": true,
            "tags": ["a", "b"],
            "company": {"name": "FOO", "catchPhrase": null}
        });
        let encoded = value.to_json_vec().unwrap();
        let decoded = DynamicValue::from_json_slice(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn object_order_preserved() {
        let raw = br#"{"z": 1, "a": 2, "m": 3}"#;
        let value = DynamicValue::from_json_slice(raw).unwrap();
        let keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn response_value_round_trip() {
        let value = dynamic!({"a": [1, 2.5, "x", null, {"b": false}]});
        let response = serde_json_bytes::Value::from(value.clone());
        assert_eq!(DynamicValue::from(response), value);
    }

    #[test]
    fn large_unsigned_widens() {
        let raw = u64::MAX.to_string();
        let value = DynamicValue::from_json_slice(raw.as_bytes()).unwrap();
        assert_eq!(value, DynamicValue::Float(u64::MAX as f64));
    }

    #[test]
    fn enum_renders_as_name_in_responses() {
        let value = DynamicValue::Enum {
            name: "ACTIVE".to_string(),
            value: Box::new(DynamicValue::Int(1)),
        };
        assert_eq!(
            serde_json_bytes::Value::from(value),
            serde_json_bytes::Value::String("ACTIVE".into())
        );
    }
}
