//! Batch windows: time-bounded accumulators that collapse sibling upstream
//! calls sharing an endpoint shape into one physical request.
//!
//! A window opens when the first call arrives and closes `delay` later, or
//! earlier when `max_size` calls have accumulated. REST windows merge the
//! group key's values into repeated query parameters and distribute the
//! response array by `batch_key`; GraphQL windows POST an array of
//! operations and distribute strictly by position.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use http::header::HeaderValue;
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::blueprint::Batching;
use crate::endpoint::Method;
use crate::error::ResolverError;
use crate::graphql;
use crate::http::UpstreamClient;
use crate::http::UpstreamRequest;
use crate::http::UpstreamResponse;
use crate::value::DynamicValue;

#[derive(Clone, Debug)]
pub(crate) struct BatchSettings {
    /// How long a window stays open after its first arrival.
    pub(crate) delay: Duration,
    /// Closes the window early; `0` means no size limit.
    pub(crate) max_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        BatchSettings {
            delay: Duration::ZERO,
            max_size: 100,
        }
    }
}

/// The shape shared by every member of a REST window: everything about the
/// request except the group key's value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RestKey {
    method: Method,
    base: String,
    headers: Vec<(String, String)>,
    extra_query: Vec<(String, String)>,
}

impl RestKey {
    fn of(request: &UpstreamRequest, group_by: &str) -> RestKey {
        let mut base = request.url.clone();
        base.set_query(None);
        let mut extra_query: Vec<(String, String)> = request
            .url
            .query_pairs()
            .filter(|(k, _)| k != group_by)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        extra_query.sort();
        RestKey {
            method: request.method,
            base: base.to_string(),
            headers: sorted_headers(&request.headers),
            extra_query,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct GraphQLKey {
    url: String,
    headers: Vec<(String, String)>,
}

fn sorted_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    entries.sort();
    entries
}

struct RestItem {
    group_value: String,
    request: UpstreamRequest,
    responder: oneshot::Sender<Result<UpstreamResponse, ResolverError>>,
}

struct GraphQLItem {
    operation: graphql::Request,
    responder: oneshot::Sender<Result<graphql::Response, ResolverError>>,
}

struct Window<T> {
    id: u64,
    sender: mpsc::Sender<T>,
}

/// The per-request table of open windows.
pub(crate) struct BatchQueue {
    settings: BatchSettings,
    client: Arc<dyn UpstreamClient>,
    rest: Mutex<HashMap<RestKey, Window<RestItem>>>,
    graphql: Mutex<HashMap<GraphQLKey, Window<GraphQLItem>>>,
    next_window: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchQueue {
    pub(crate) fn new(client: Arc<dyn UpstreamClient>, settings: BatchSettings) -> BatchQueue {
        BatchQueue {
            settings,
            client,
            rest: Mutex::new(HashMap::new()),
            graphql: Mutex::new(HashMap::new()),
            next_window: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Aborts every window coordinator still running. Called when the
    /// owning loader drops, so request cancellation reaches pending
    /// windows.
    pub(crate) fn abort_all(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn capacity(&self) -> usize {
        if self.settings.max_size == 0 {
            1024
        } else {
            self.settings.max_size
        }
    }

    pub(crate) async fn load_rest(
        self: &Arc<Self>,
        request: UpstreamRequest,
        batching: &Batching,
    ) -> Result<UpstreamResponse, ResolverError> {
        let group_value = request
            .url
            .query_pairs()
            .find(|(k, _)| k == batching.group_by.as_str())
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| ResolverError::Batching {
                reason: format!(
                    "group key '{}' is missing from the request query",
                    batching.group_by
                ),
            })?;
        let key = RestKey::of(&request, &batching.group_by);
        let (responder, receiver) = oneshot::channel();
        let mut item = RestItem {
            group_value,
            request,
            responder,
        };

        loop {
            let sender = {
                let mut windows = self.rest.lock();
                match windows.get(&key) {
                    Some(window) => window.sender.clone(),
                    None => {
                        let (sender, rx) = mpsc::channel(self.capacity());
                        let id = self.next_window.fetch_add(1, Ordering::Relaxed);
                        windows.insert(
                            key.clone(),
                            Window {
                                id,
                                sender: sender.clone(),
                            },
                        );
                        let queue = Arc::clone(self);
                        let window_key = key.clone();
                        let batching = batching.clone();
                        let task = tokio::spawn(async move {
                            queue.run_rest_window(window_key, id, rx, batching).await;
                        });
                        self.tasks.lock().push(task);
                        sender
                    }
                }
            };
            match sender.send(item).await {
                Ok(()) => break,
                // The window closed under us; open a fresh one.
                Err(mpsc::error::SendError(returned)) => item = returned,
            }
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ResolverError::Cancelled {
                reason: "batch window was dropped before completing".to_string(),
            }),
        }
    }

    async fn run_rest_window(
        self: Arc<Self>,
        key: RestKey,
        id: u64,
        mut rx: mpsc::Receiver<RestItem>,
        batching: Batching,
    ) {
        let mut items = self.collect(&mut rx).await;
        {
            let mut windows = self.rest.lock();
            if windows.get(&key).map(|w| w.id) == Some(id) {
                windows.remove(&key);
            }
        }
        rx.close();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        if items.is_empty() {
            return;
        }

        let request = assemble_rest(&items, &batching);
        tracing::debug!(size = items.len(), url = %request.url, "closing batch window");
        match self.client.execute(request).await {
            Ok(response) => distribute_rest(items, response, &batching),
            Err(error) => fail_all(
                items.into_iter().map(|item| item.responder),
                error.to_string(),
            ),
        }
    }

    pub(crate) async fn load_graphql(
        self: &Arc<Self>,
        url: url::Url,
        headers: HeaderMap,
        operation: graphql::Request,
    ) -> Result<graphql::Response, ResolverError> {
        let key = GraphQLKey {
            url: url.to_string(),
            headers: sorted_headers(&headers),
        };
        let (responder, receiver) = oneshot::channel();
        let mut item = GraphQLItem {
            operation,
            responder,
        };

        loop {
            let sender = {
                let mut windows = self.graphql.lock();
                match windows.get(&key) {
                    Some(window) => window.sender.clone(),
                    None => {
                        let (sender, rx) = mpsc::channel(self.capacity());
                        let id = self.next_window.fetch_add(1, Ordering::Relaxed);
                        windows.insert(
                            key.clone(),
                            Window {
                                id,
                                sender: sender.clone(),
                            },
                        );
                        let queue = Arc::clone(self);
                        let window_key = key.clone();
                        let target = url.clone();
                        let target_headers = headers.clone();
                        let task = tokio::spawn(async move {
                            queue
                                .run_graphql_window(window_key, id, rx, target, target_headers)
                                .await;
                        });
                        self.tasks.lock().push(task);
                        sender
                    }
                }
            };
            match sender.send(item).await {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => item = returned,
            }
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ResolverError::Cancelled {
                reason: "batch window was dropped before completing".to_string(),
            }),
        }
    }

    async fn run_graphql_window(
        self: Arc<Self>,
        key: GraphQLKey,
        id: u64,
        mut rx: mpsc::Receiver<GraphQLItem>,
        url: url::Url,
        mut headers: HeaderMap,
    ) {
        let mut items = self.collect(&mut rx).await;
        {
            let mut windows = self.graphql.lock();
            if windows.get(&key).map(|w| w.id) == Some(id) {
                windows.remove(&key);
            }
        }
        rx.close();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        if items.is_empty() {
            return;
        }

        let operations: Vec<&graphql::Request> =
            items.iter().map(|item| &item.operation).collect();
        let body = match serde_json::to_vec(&operations) {
            Ok(body) => bytes::Bytes::from(body),
            Err(error) => {
                return fail_all(
                    items.into_iter().map(|item| item.responder),
                    format!("batched operations failed to serialize: {error}"),
                )
            }
        };
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        let request = UpstreamRequest {
            method: Method::Post,
            url,
            headers,
            body,
        };

        tracing::debug!(size = items.len(), url = %request.url, "closing GraphQL batch window");
        let response = match self.client.execute(request).await {
            Ok(response) => response,
            Err(error) => {
                return fail_all(
                    items.into_iter().map(|item| item.responder),
                    error.to_string(),
                )
            }
        };

        let elements = match response.body {
            DynamicValue::List(elements) if elements.len() == items.len() => elements,
            DynamicValue::List(elements) => {
                // Arity mismatch: attribution would be guesswork, so the
                // whole batch fails.
                let expected = items.len();
                let got = elements.len();
                return fail_all(
                    items.into_iter().map(|item| item.responder),
                    format!("expected {expected} batched responses, upstream sent {got}"),
                );
            }
            _ => {
                return fail_all(
                    items.into_iter().map(|item| item.responder),
                    "expected an array of responses from the batched upstream call".to_string(),
                )
            }
        };

        for (item, element) in items.into_iter().zip(elements) {
            let parsed = serde_json::from_value::<graphql::Response>(element.into()).map_err(
                |error| ResolverError::MalformedResponse {
                    reason: format!("not a GraphQL response: {error}"),
                },
            );
            let _ = item.responder.send(parsed);
        }
    }

    /// Receives until the window's deadline or size limit.
    async fn collect<T>(&self, rx: &mut mpsc::Receiver<T>) -> Vec<T> {
        let mut items = Vec::new();
        let deadline = tokio::time::sleep(self.settings.delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                received = rx.recv() => match received {
                    Some(item) => {
                        items.push(item);
                        if self.settings.max_size > 0 && items.len() >= self.settings.max_size {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
        items
    }
}

fn assemble_rest(items: &[RestItem], batching: &Batching) -> UpstreamRequest {
    let mut seen: HashSet<String> = items[0]
        .request
        .url
        .query_pairs()
        .filter(|(k, _)| k == batching.group_by.as_str())
        .map(|(_, v)| v.into_owned())
        .collect();
    let mut request = items[0].request.clone();
    {
        let mut pairs = request.url.query_pairs_mut();
        for item in &items[1..] {
            if seen.insert(item.group_value.clone()) {
                pairs.append_pair(&batching.group_by, &item.group_value);
            }
        }
    }
    request
}

fn distribute_rest(items: Vec<RestItem>, response: UpstreamResponse, batching: &Batching) {
    if !matches!(response.body, DynamicValue::List(_)) {
        return fail_all(
            items.into_iter().map(|item| item.responder),
            "expected an array from the batched upstream call".to_string(),
        );
    }
    let groups = response.body.group_by(&batching.batch_key);
    for item in items {
        let matched = groups.get(item.group_value.as_str());
        let body = if batching.list {
            DynamicValue::List(
                matched
                    .map(|group| group.iter().map(|v| (*v).clone()).collect())
                    .unwrap_or_default(),
            )
        } else {
            // No matching element resolves to null, by contract.
            matched
                .and_then(|group| group.first())
                .map(|v| (*v).clone())
                .unwrap_or_default()
        };
        let _ = item.responder.send(Ok(response.with_body(body)));
    }
}

fn fail_all<T>(
    responders: impl Iterator<Item = oneshot::Sender<Result<T, ResolverError>>>,
    reason: String,
) {
    for responder in responders {
        let _ = responder.send(Err(ResolverError::Batching {
            reason: reason.clone(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;

    use super::*;
    use crate::dynamic;
    use crate::loader::test_support::StaticClient;

    fn settings(delay_ms: u64, max_size: usize) -> BatchSettings {
        BatchSettings {
            delay: Duration::from_millis(delay_ms),
            max_size,
        }
    }

    fn get(url: &str) -> UpstreamRequest {
        UpstreamRequest {
            method: Method::Get,
            url: url::Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
            body: bytes::Bytes::new(),
        }
    }

    fn batching(group_by: &str) -> Batching {
        Batching {
            group_by: group_by.to_string(),
            batch_key: vec![group_by.to_string()],
            list: false,
        }
    }

    #[test_log::test(tokio::test)]
    async fn grouped_calls_collapse_into_one_request() {
        let client = Arc::new(StaticClient::returning(dynamic!([
            {"userId": "1", "title": "a"},
            {"userId": "2", "title": "b"}
        ])));
        let queue = Arc::new(BatchQueue::new(client.clone(), settings(20, 100)));

        let batching_key = batching("userId");
        let first = queue.load_rest(get("http://upstream/posts?userId=1"), &batching_key);
        let second = queue.load_rest(get("http://upstream/posts?userId=2"), &batching_key);
        let results = futures::join!(first, second);

        assert_eq!(client.request_count(), 1);
        assert_eq!(
            client.requests()[0].url.to_string(),
            "http://upstream/posts?userId=1&userId=2"
        );
        assert_eq!(
            results.0.unwrap().body,
            dynamic!({"userId": "1", "title": "a"})
        );
        assert_eq!(
            results.1.unwrap().body,
            dynamic!({"userId": "2", "title": "b"})
        );
    }

    #[tokio::test]
    async fn attribution_survives_upstream_reordering_and_omission() {
        // Upstream reorders and omits userId=3 entirely.
        let client = Arc::new(StaticClient::returning(dynamic!([
            {"userId": "2", "title": "b"},
            {"userId": "1", "title": "a"}
        ])));
        let queue = Arc::new(BatchQueue::new(client, settings(20, 100)));

        let results = join_all([
            queue.load_rest(get("http://upstream/posts?userId=1"), &batching("userId")),
            queue.load_rest(get("http://upstream/posts?userId=2"), &batching("userId")),
            queue.load_rest(get("http://upstream/posts?userId=3"), &batching("userId")),
        ])
        .await;

        assert_eq!(
            results[0].as_ref().unwrap().body,
            dynamic!({"userId": "1", "title": "a"})
        );
        assert_eq!(
            results[1].as_ref().unwrap().body,
            dynamic!({"userId": "2", "title": "b"})
        );
        assert_eq!(results[2].as_ref().unwrap().body, DynamicValue::Null);
    }

    #[tokio::test]
    async fn list_fields_collect_every_match() {
        let client = Arc::new(StaticClient::returning(dynamic!([
            {"userId": "1", "title": "a"},
            {"userId": "1", "title": "b"},
            {"userId": "2", "title": "c"}
        ])));
        let queue = Arc::new(BatchQueue::new(client, settings(20, 100)));
        let list_batching = Batching {
            list: true,
            ..batching("userId")
        };

        let results = join_all([
            queue.load_rest(get("http://upstream/posts?userId=1"), &list_batching),
            queue.load_rest(get("http://upstream/posts?userId=2"), &list_batching),
        ])
        .await;

        assert_eq!(
            results[0].as_ref().unwrap().body,
            dynamic!([{"userId": "1", "title": "a"}, {"userId": "1", "title": "b"}])
        );
        assert_eq!(
            results[1].as_ref().unwrap().body,
            dynamic!([{"userId": "2", "title": "c"}])
        );
    }

    #[tokio::test]
    async fn max_size_closes_the_window_early() {
        let client = Arc::new(StaticClient::returning(dynamic!([])));
        let queue = Arc::new(BatchQueue::new(client.clone(), settings(5_000, 1)));

        let results = join_all([
            queue.load_rest(get("http://upstream/posts?userId=1"), &batching("userId")),
            queue.load_rest(get("http://upstream/posts?userId=2"), &batching("userId")),
        ])
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn different_shapes_use_different_windows() {
        let client = Arc::new(StaticClient::returning(dynamic!([])));
        let queue = Arc::new(BatchQueue::new(client.clone(), settings(20, 100)));

        let batching_key = batching("userId");
        let _ = futures::join!(
            queue.load_rest(get("http://upstream/posts?userId=1"), &batching_key),
            queue.load_rest(
                get("http://upstream/posts?userId=2&sort=asc"),
                &batching_key
            ),
        );
        // The extra `sort` parameter is part of the window key.
        assert_eq!(client.request_count(), 2);
    }

    #[tokio::test]
    async fn upstream_failure_reaches_every_caller() {
        let client = Arc::new(StaticClient::failing("connection refused"));
        let queue = Arc::new(BatchQueue::new(client, settings(20, 100)));

        let results = join_all([
            queue.load_rest(get("http://upstream/posts?userId=1"), &batching("userId")),
            queue.load_rest(get("http://upstream/posts?userId=2"), &batching("userId")),
        ])
        .await;

        for result in results {
            match result {
                Err(ResolverError::Batching { reason }) => {
                    assert!(reason.contains("connection refused"))
                }
                other => panic!("expected a batching error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn graphql_batch_is_positional() {
        let client = Arc::new(StaticClient::returning(dynamic!([
            {"data": {"post": {"id": 3}}},
            {"data": {"post": {"id": 5}}}
        ])));
        let queue = Arc::new(BatchQueue::new(client.clone(), settings(20, 100)));
        let url = url::Url::parse("http://upstream/graphql").unwrap();

        let results = join_all([
            queue.load_graphql(
                url.clone(),
                HeaderMap::new(),
                graphql::Request::builder()
                    .query("query { post(id: 3) { id } }")
                    .build(),
            ),
            queue.load_graphql(
                url.clone(),
                HeaderMap::new(),
                graphql::Request::builder()
                    .query("query { post(id: 5) { id } }")
                    .build(),
            ),
        ])
        .await;

        assert_eq!(client.request_count(), 1);
        let sent = &client.requests()[0];
        assert_eq!(sent.method, Method::Post);
        let operations: Vec<graphql::Request> = serde_json::from_slice(&sent.body).unwrap();
        assert_eq!(operations.len(), 2);
        assert!(operations[0].query.contains("id: 3"));

        assert_eq!(
            results[0].as_ref().unwrap().data,
            Some(serde_json_bytes::json!({"post": {"id": 3}}))
        );
        assert_eq!(
            results[1].as_ref().unwrap().data,
            Some(serde_json_bytes::json!({"post": {"id": 5}}))
        );
    }

    #[tokio::test]
    async fn graphql_arity_mismatch_fails_the_whole_batch() {
        let client = Arc::new(StaticClient::returning(dynamic!([
            {"data": {"post": {"id": 3}}}
        ])));
        let queue = Arc::new(BatchQueue::new(client, settings(20, 100)));
        let url = url::Url::parse("http://upstream/graphql").unwrap();

        let results = join_all([
            queue.load_graphql(
                url.clone(),
                HeaderMap::new(),
                graphql::Request::builder().query("query { a }").build(),
            ),
            queue.load_graphql(
                url.clone(),
                HeaderMap::new(),
                graphql::Request::builder().query("query { b }").build(),
            ),
        ])
        .await;

        for result in results {
            assert!(matches!(result, Err(ResolverError::Batching { .. })));
        }
    }
}
