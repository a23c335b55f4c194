use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value;

use super::Object;

/// A GraphQL request as posted to the gateway:
/// `{query, operationName?, variables?}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub query: String,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub operation_name: Option<String>,

    #[serde(skip_serializing_if = "Object::is_empty", default)]
    pub variables: Object,
}

#[buildstructor::buildstructor]
impl Request {
    #[builder(visibility = "pub")]
    fn new(
        query: String,
        operation_name: Option<String>,
        variables: JsonMap<ByteString, Value>,
    ) -> Self {
        Self {
            query,
            operation_name,
            variables,
        }
    }

    /// Decodes a request body, reporting the reason on failure.
    pub fn from_slice(body: &[u8]) -> Result<Request, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn decodes_minimal_body() {
        let request = Request::from_slice(br#"{"query": "{ me { id } }"}"#).unwrap();
        assert_eq!(request.query, "{ me { id } }");
        assert!(request.operation_name.is_none());
        assert!(request.variables.is_empty());
    }

    #[test]
    fn decodes_variables() {
        let request = Request::from_slice(
            br#"{"query": "query Q($id: Int) { user(id: $id) { id } }", "variables": {"id": 3}}"#,
        )
        .unwrap();
        assert_eq!(request.variables.get("id"), Some(&json!(3)));
    }

    #[test]
    fn round_trips_through_builder() {
        let request = Request::builder()
            .query("{ foos { id } }")
            .operation_name("Foos")
            .build();
        let encoded = serde_json::to_string(&request).unwrap();
        assert_eq!(
            serde_json::from_str::<Request>(&encoded).unwrap(),
            request
        );
    }
}
