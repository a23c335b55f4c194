//! Types related to GraphQL requests, responses and errors.

mod request;
mod response;

use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

pub use request::Request;
pub use response::Response;

use crate::json_ext::Path;

/// A JSON object as it appears in response data and error extensions.
pub type Object = JsonMap<ByteString, Value>;

/// The location of an error in the originating GraphQL document.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

/// A [GraphQL error](https://spec.graphql.org/October2021/#sec-Errors) as
/// found in the `errors` member of a response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Error {
    pub message: String,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub locations: Vec<Location>,

    /// If this is a field error, the path to that field in the data.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub path: Option<Path>,

    #[serde(default, skip_serializing_if = "Object::is_empty")]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Error {
    /// Returns a builder for a GraphQL [`Error`]; `message` is required,
    /// `extension_code` lands in `extensions.code`.
    #[builder(visibility = "pub")]
    fn new<T: Into<String>>(
        message: String,
        locations: Vec<Location>,
        path: Option<Path>,
        extension_code: T,
        mut extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        extensions
            .entry("code")
            .or_insert_with(|| extension_code.into().into());
        Self {
            message,
            locations,
            path,
            extensions,
        }
    }

    /// Decodes one entry of an upstream `errors` array, tolerating absent
    /// optional members.
    pub(crate) fn from_value(value: Value) -> Option<Error> {
        let mut object = match value {
            Value::Object(object) => object,
            _ => return None,
        };
        let message = match object.remove("message") {
            Some(Value::String(s)) => s.as_str().to_string(),
            _ => return None,
        };
        let locations = object
            .remove("locations")
            .and_then(|v| serde_json_bytes::from_value(v).ok())
            .unwrap_or_default();
        let path = object
            .remove("path")
            .and_then(|v| serde_json_bytes::from_value(v).ok());
        let extensions = match object.remove("extensions") {
            Some(Value::Object(map)) => map,
            _ => Object::default(),
        };
        Some(Error {
            message,
            locations,
            path,
            extensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn error_builder_inserts_code() {
        let error = Error::builder()
            .message("boom")
            .extension_code("UPSTREAM_HTTP_ERROR")
            .build();
        assert_eq!(error.extensions.get("code"), Some(&json!("UPSTREAM_HTTP_ERROR")));
    }

    #[test]
    fn error_serializes_path_as_array() {
        let error = Error::builder()
            .message("boom")
            .path(Path::empty().key("foos").index(1))
            .extension_code("X")
            .build();
        let encoded = serde_json::to_value(&error).unwrap();
        assert_eq!(encoded["path"], serde_json::json!(["foos", 1]));
    }

    #[test]
    fn from_value_requires_message() {
        assert!(Error::from_value(json!({"path": ["a"]})).is_none());
        let error = Error::from_value(json!({"message": "nope"})).unwrap();
        assert_eq!(error.message, "nope");
    }
}
