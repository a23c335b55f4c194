//! The request-scoped data loader: deduplication and batching in front of
//! the upstream client.
//!
//! One loader exists per inbound GraphQL request. Dropping it cancels the
//! batch windows it still has open.

mod batch;
mod dedup;
mod fingerprint;

use std::sync::Arc;

use http::HeaderMap;

pub(crate) use batch::BatchSettings;
pub use fingerprint::Fingerprint;

use crate::blueprint::Batching;
use crate::error::ResolverError;
use crate::graphql;
use crate::http::HttpCache;
use crate::http::UpstreamClient;
use crate::http::UpstreamRequest;
use crate::http::UpstreamResponse;

/// Per-request knobs, lifted from the upstream configuration.
#[derive(Clone, Default)]
pub struct LoaderSettings {
    pub(crate) batch: BatchSettings,
    /// When present, GET responses consult and feed the process-wide
    /// cache; a hit short-circuits the fingerprint dedup.
    pub(crate) http_cache: Option<Arc<HttpCache>>,
}

impl LoaderSettings {
    pub fn new(delay: std::time::Duration, max_size: usize) -> Self {
        LoaderSettings {
            batch: BatchSettings { delay, max_size },
            http_cache: None,
        }
    }

    pub fn with_http_cache(mut self, cache: Arc<HttpCache>) -> Self {
        self.http_cache = Some(cache);
        self
    }
}

pub struct DataLoader {
    client: Arc<dyn UpstreamClient>,
    http_cache: Option<Arc<HttpCache>>,
    dedup: dedup::DedupMap,
    batches: Arc<batch::BatchQueue>,
}

impl DataLoader {
    pub fn new(client: Arc<dyn UpstreamClient>, settings: LoaderSettings) -> DataLoader {
        DataLoader {
            batches: Arc::new(batch::BatchQueue::new(client.clone(), settings.batch)),
            http_cache: settings.http_cache,
            client,
            dedup: dedup::DedupMap::default(),
        }
    }

    /// Issues one upstream call, going through the HTTP cache (GET only)
    /// and the in-flight dedup map.
    pub async fn load(
        &self,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, ResolverError> {
        if let Some(cache) = &self.http_cache {
            if let Some(hit) = cache.get(&request) {
                tracing::debug!(url = %request.url, "http cache hit");
                return Ok(hit);
            }
        }

        let fingerprint = Fingerprint::of(&request);
        let client = Arc::clone(&self.client);
        let cache = self.http_cache.clone();
        self.dedup
            .load(fingerprint, move || async move {
                let response = client.execute(request.clone()).await?;
                if let Some(cache) = cache {
                    cache.store(&request, &response);
                }
                Ok(response)
            })
            .await
    }

    /// Places the call into a batch window instead of issuing it; resolves
    /// with the response slice attributed to this caller.
    pub async fn load_batched(
        &self,
        request: UpstreamRequest,
        batching: &Batching,
    ) -> Result<UpstreamResponse, ResolverError> {
        self.batches.load_rest(request, batching).await
    }

    /// Coalesces sibling GraphQL operations against the same upstream into
    /// one array-bodied POST; responses distribute by position.
    pub async fn load_graphql(
        &self,
        url: url::Url,
        headers: HeaderMap,
        operation: graphql::Request,
    ) -> Result<graphql::Response, ResolverError> {
        self.batches.load_graphql(url, headers, operation).await
    }
}

impl Drop for DataLoader {
    fn drop(&mut self) {
        // Outstanding windows must not fire after the request is gone.
        self.batches.abort_all();
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;

    use super::test_support::StaticClient;
    use super::*;
    use crate::dynamic;
    use crate::endpoint::Method;

    fn get(url: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: Method::Get,
            url: url::Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
            body: bytes::Bytes::new(),
        }
    }

    #[tokio::test]
    async fn duplicate_loads_share_one_call() {
        let client = Arc::new(StaticClient::returning(dynamic!({"id": 1})));
        let loader = DataLoader::new(client.clone(), LoaderSettings::default());

        let results = join_all((0..50).map(|_| loader.load(get("http://upstream/users/1")))).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test]
    async fn cache_hit_short_circuits_dedup() {
        let client = Arc::new(StaticClient::returning(dynamic!({"id": 1})));
        let cache = Arc::new(HttpCache::default());
        let cached = UpstreamResponse {
            status: http::StatusCode::OK,
            headers: [(
                http::header::CACHE_CONTROL,
                http::header::HeaderValue::from_static("max-age=60"),
            )]
            .into_iter()
            .collect(),
            body: dynamic!({"id": "cached"}),
        };
        cache.store(&get("http://upstream/users/1"), &cached);

        let loader = DataLoader::new(
            client.clone(),
            LoaderSettings::default().with_http_cache(cache),
        );
        let response = loader.load(get("http://upstream/users/1")).await.unwrap();
        assert_eq!(response.body, dynamic!({"id": "cached"}));
        assert_eq!(client.request_count(), 0);
    }

    #[tokio::test]
    async fn loads_feed_the_cache_when_response_allows() {
        let client = Arc::new(StaticClient::returning(dynamic!({"id": 1})));
        let cache = Arc::new(HttpCache::default());
        let loader = DataLoader::new(
            client.clone(),
            LoaderSettings::default().with_http_cache(cache.clone()),
        );
        // StaticClient sends no cache headers, so nothing is stored.
        loader.load(get("http://upstream/users/1")).await.unwrap();
        assert!(cache.get(&get("http://upstream/users/1")).is_none());
    }
}
