//! The self-describing value that flows through the interpreter.
//!
//! Every upstream JSON response, every GraphQL argument and every
//! intermediate value produced by a resolver expression is a
//! [`DynamicValue`]. Mappings preserve insertion order so that upstream
//! payloads survive a round-trip unchanged.

mod convert;
mod schema;

use std::borrow::Cow;
use std::collections::HashMap;

use bytes::Bytes;
use indexmap::IndexMap;

pub use schema::TSchema;

/// An ordered mapping from string keys to values.
pub type Object = IndexMap<String, DynamicValue>;

#[derive(Clone, Debug, PartialEq, Default)]
pub enum DynamicValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Binary(Bytes),
    List(Vec<DynamicValue>),
    Object(Object),
    /// A tagged constructor: a name plus its payload.
    Enum {
        name: String,
        value: Box<DynamicValue>,
    },
}

impl DynamicValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DynamicValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynamicValue::Int(i) => Some(*i as f64),
            DynamicValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            DynamicValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Walks a dotted path: object lookup by key, list lookup by a
    /// decimal-digit segment. A `Null` node ends the walk.
    pub fn get_path<T: AsRef<str>>(&self, parts: &[T]) -> Option<&DynamicValue> {
        let mut current = self;
        for part in parts {
            let part = part.as_ref();
            current = match current {
                DynamicValue::Object(map) => map.get(part)?,
                DynamicValue::List(items) => items.get(part.parse::<usize>().ok()?)?,
                DynamicValue::Enum { value, .. } => value.get_path(&[part])?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// The textual form used when a template parameter resolves to this
    /// value: strings emit unquoted, numbers and booleans emit their
    /// canonical form, structured values emit JSON.
    pub fn to_path_string(&self) -> Cow<'_, str> {
        match self {
            DynamicValue::Null => Cow::Borrowed("null"),
            DynamicValue::Bool(b) => Cow::Owned(b.to_string()),
            DynamicValue::Int(i) => Cow::Owned(i.to_string()),
            DynamicValue::Float(f) => Cow::Owned(f.to_string()),
            DynamicValue::String(s) => Cow::Borrowed(s),
            DynamicValue::Binary(bytes) => String::from_utf8_lossy(bytes),
            DynamicValue::Enum { name, .. } => Cow::Borrowed(name),
            DynamicValue::List(_) | DynamicValue::Object(_) => {
                Cow::Owned(serde_json::Value::from(self.clone()).to_string())
            }
        }
    }

    /// Indexes the elements of a list by the stringified leaf found at
    /// `path` inside each element. Elements without the leaf are skipped.
    ///
    /// This is the distribution side of batching: upstream ordering is
    /// arbitrary, so callers look their element up by key instead of
    /// zipping.
    pub fn group_by<T: AsRef<str>>(&self, path: &[T]) -> HashMap<String, Vec<&DynamicValue>> {
        let mut groups: HashMap<String, Vec<&DynamicValue>> = HashMap::new();
        if let DynamicValue::List(items) = self {
            for item in items {
                if let Some(leaf) = item.get_path(path) {
                    groups
                        .entry(leaf.to_path_string().into_owned())
                        .or_default()
                        .push(item);
                }
            }
        }
        groups
    }
}

impl From<bool> for DynamicValue {
    fn from(b: bool) -> Self {
        DynamicValue::Bool(b)
    }
}

impl From<i64> for DynamicValue {
    fn from(i: i64) -> Self {
        DynamicValue::Int(i)
    }
}

impl From<f64> for DynamicValue {
    fn from(f: f64) -> Self {
        DynamicValue::Float(f)
    }
}

impl From<&str> for DynamicValue {
    fn from(s: &str) -> Self {
        DynamicValue::String(s.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(s: String) -> Self {
        DynamicValue::String(s)
    }
}

impl<V: Into<DynamicValue>> FromIterator<V> for DynamicValue {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        DynamicValue::List(iter.into_iter().map(Into::into).collect())
    }
}
