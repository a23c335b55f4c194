//! The upstream HTTP client.

use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::UpstreamRequest;
use super::UpstreamResponse;
use crate::error::ResolverError;
use crate::value::DynamicValue;

/// The loader's view of an HTTP client. The production implementation is
/// [`ClientService`]; tests substitute counters and canned responses.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ResolverError>;
}

/// Issues upstream requests over a shared connection pool and materializes
/// responses into dynamic values.
#[derive(Clone)]
pub struct ClientService {
    client: reqwest::Client,
}

impl ClientService {
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .connect_timeout(connect_timeout)
                .tcp_keepalive(Some(Duration::from_secs(5)))
                .build()
                .expect("client configuration is static; qed"),
        }
    }

    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ResolverError> {
        tracing::debug!(method = %request.method, url = %request.url, "upstream request");
        let url = request.url.to_string();
        let upstream_error = |reason: String, status: Option<u16>| ResolverError::UpstreamHttp {
            status_code: status,
            url: url.clone(),
            reason,
        };

        let mut builder = self
            .client
            .request(request.method.as_http(), request.url.clone())
            .headers(request.headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| upstream_error(e.to_string(), e.status().map(|s| s.as_u16())))?;

        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| upstream_error(e.to_string(), Some(status.as_u16())))?;

        if !status.is_success() {
            return Err(upstream_error(
                format!("upstream returned {status}"),
                Some(status.as_u16()),
            ));
        }

        let body = if bytes.is_empty() {
            DynamicValue::Null
        } else {
            DynamicValue::from_json_slice(&bytes).map_err(|e| {
                ResolverError::MalformedResponse {
                    reason: format!("invalid JSON from {url}: {e}"),
                }
            })?
        };

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

impl Default for ClientService {
    fn default() -> Self {
        ClientService::new(Duration::from_secs(60), Duration::from_secs(10))
    }
}

#[async_trait]
impl UpstreamClient for ClientService {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ResolverError> {
        self.fetch(request).await
    }
}

impl tower::Service<UpstreamRequest> for ClientService {
    type Response = UpstreamResponse;
    type Error = tower::BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: UpstreamRequest) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.fetch(request).await.map_err(Into::into) })
    }
}
