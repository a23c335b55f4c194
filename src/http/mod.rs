//! Upstream HTTP plumbing: the request/response model, the client service
//! and the process-wide response cache.

mod cache;
mod client;

use bytes::Bytes;
use http::HeaderMap;
use http::StatusCode;

pub use cache::HttpCache;
pub use client::ClientService;
pub use client::UpstreamClient;

use crate::value::DynamicValue;

/// A concrete request produced by evaluating an endpoint template.
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: crate::endpoint::Method,
    pub url: url::Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// An upstream response materialized into a dynamic value.
#[derive(Clone, Debug, Default)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: DynamicValue,
}

impl UpstreamResponse {
    /// Replaces the body, keeping status and headers. Used when a batched
    /// response is split between its logical callers.
    pub fn with_body(&self, body: DynamicValue) -> UpstreamResponse {
        UpstreamResponse {
            status: self.status,
            headers: self.headers.clone(),
            body,
        }
    }
}
