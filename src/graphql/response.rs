use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use super::Error;
use super::Object;

/// A GraphQL response: `{data?, errors?, extensions?}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,

    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<Error>,

    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub extensions: Object,
}

#[buildstructor::buildstructor]
impl Response {
    #[builder(visibility = "pub")]
    fn new(
        data: Option<Value>,
        errors: Vec<Error>,
        extensions: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            data,
            errors,
            extensions,
        }
    }

    /// A response consisting of request-level errors only.
    pub fn from_errors(errors: Vec<Error>) -> Self {
        Self {
            data: None,
            errors,
            extensions: Object::default(),
        }
    }

    /// Decodes an upstream response body leniently: `data` is taken as-is,
    /// malformed entries of `errors` are dropped rather than failing the
    /// whole response.
    pub(crate) fn from_bytes(body: Bytes) -> Result<Response, serde_json::Error> {
        let value = Value::from_bytes(body)?;
        let mut object = match value {
            Value::Object(object) => object,
            other => {
                return Ok(Response {
                    data: Some(other),
                    ..Default::default()
                })
            }
        };
        let data = object.remove("data");
        let errors = match object.remove("errors") {
            Some(Value::Array(entries)) => {
                entries.into_iter().filter_map(Error::from_value).collect()
            }
            _ => Vec::new(),
        };
        let extensions = match object.remove("extensions") {
            Some(Value::Object(map)) => map,
            _ => Object::default(),
        };
        Ok(Response {
            data,
            errors,
            extensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn encodes_data_without_empty_members() {
        let response = Response::builder().data(json!({"me": {"id": 1}})).build();
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"data":{"me":{"id":1}}}"#
        );
    }

    #[test]
    fn decodes_data_and_errors() {
        let body = Bytes::from_static(
            br#"{"data": {"post": null}, "errors": [{"message": "boom", "path": ["post"]}]}"#,
        );
        let response = Response::from_bytes(body).unwrap();
        assert_eq!(response.data, Some(json!({"post": null})));
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].message, "boom");
    }

    #[test]
    fn malformed_error_entries_are_dropped() {
        let body = Bytes::from_static(br#"{"data": 1, "errors": [{"no_message": true}, 42]}"#);
        let response = Response::from_bytes(body).unwrap();
        assert!(response.errors.is_empty());
        assert_eq!(response.data, Some(json!(1)));
    }
}
