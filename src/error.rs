//! Gateway errors.

use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;

use crate::graphql;
use crate::json_ext::Path;

/// Errors raised while resolving a field at request time.
///
/// These are not returned to the client directly; they convert to entries
/// of the response's `errors` array via [`ResolverError::to_graphql_error`].
#[derive(Error, Display, Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
#[ignore_extra_doc_attributes]
#[non_exhaustive]
pub enum ResolverError {
    /// expression evaluation failed: {reason}
    Evaluation {
        /// What went wrong inside the interpreter.
        reason: String,
    },

    /// HTTP fetch from '{url}' failed: {reason}
    ///
    /// A transport-level failure, not a GraphQL error from the upstream.
    UpstreamHttp {
        status_code: Option<u16>,
        url: String,
        reason: String,
    },

    /// upstream response was malformed: {reason}
    MalformedResponse { reason: String },

    /// upstream GraphQL operation returned an error: {reason}
    UpstreamGraphQL { reason: String },

    /// upstream response did not match the declared schema: {reason}
    Decoding { reason: String },

    /// batched upstream call failed: {reason}
    ///
    /// Carried verbatim to every logical caller in the window.
    Batching { reason: String },

    /// request timed out
    Timeout,

    /// request was cancelled: {reason}
    Cancelled { reason: String },
}

impl ResolverError {
    pub fn evaluation(reason: impl Into<String>) -> Self {
        ResolverError::Evaluation {
            reason: reason.into(),
        }
    }

    pub(crate) fn extension_code(&self) -> &'static str {
        match self {
            ResolverError::Evaluation { .. } => "EXPRESSION_EVALUATION_FAILED",
            ResolverError::UpstreamHttp { .. } => "UPSTREAM_HTTP_ERROR",
            ResolverError::MalformedResponse { .. } => "MALFORMED_UPSTREAM_RESPONSE",
            ResolverError::UpstreamGraphQL { .. } => "UPSTREAM_GRAPHQL_ERROR",
            ResolverError::Decoding { .. } => "RESPONSE_DECODING_FAILED",
            ResolverError::Batching { .. } => "UPSTREAM_BATCHING_ERROR",
            ResolverError::Timeout => "REQUEST_TIMEOUT",
            ResolverError::Cancelled { .. } => "REQUEST_CANCELLED",
        }
    }

    /// Converts to a GraphQL error, with the variant's fields exposed in
    /// `extensions` next to the machine `code`.
    pub fn to_graphql_error(&self, path: Option<Path>) -> graphql::Error {
        let mut extensions = serde_json_bytes::to_value(self)
            .ok()
            .and_then(|value| value.as_object().cloned())
            .unwrap_or_default();
        extensions
            .entry("code")
            .or_insert_with(|| self.extension_code().into());
        graphql::Error {
            message: self.to_string(),
            locations: Vec::new(),
            path,
            extensions,
        }
    }
}

/// Errors detected while compiling a configuration into a blueprint.
/// Reported once, at publish/check time.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum CompileError {
    #[error("query root type '{0}' is not defined")]
    MissingQueryRoot(String),

    #[error("unknown type '{reference}' referenced by {location}")]
    UnknownType { reference: String, location: String },

    #[error("field '{type_name}.{field}': {reason}")]
    InvalidField {
        type_name: String,
        field: String,
        reason: String,
    },

    #[error("invalid upstream base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("the compiled schema failed validation: {0}")]
    InvalidSchema(String),
}

#[cfg(test)]
mod tests {
    use serde_json_bytes::json;

    use super::*;

    #[test]
    fn resolver_error_converts_with_code_and_path() {
        let error = ResolverError::UpstreamHttp {
            status_code: Some(502),
            url: "http://upstream/users/1".to_string(),
            reason: "bad gateway".to_string(),
        };
        let converted = error.to_graphql_error(Some(Path::empty().key("user")));
        assert!(converted.message.contains("bad gateway"));
        assert_eq!(
            converted.extensions.get("code"),
            Some(&json!("UPSTREAM_HTTP_ERROR"))
        );
        assert_eq!(converted.extensions.get("status_code"), Some(&json!(502)));
        assert_eq!(converted.path.unwrap().to_string(), "/user");
    }

    #[test]
    fn timeout_converts_without_extra_fields() {
        let converted = ResolverError::Timeout.to_graphql_error(None);
        assert_eq!(converted.message, "request timed out");
        assert_eq!(
            converted.extensions.get("code"),
            Some(&json!("REQUEST_TIMEOUT"))
        );
    }
}
