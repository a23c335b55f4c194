//! In-flight deduplication of upstream calls.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;

use tokio::sync::broadcast;
use tokio::sync::Mutex;

use super::Fingerprint;
use crate::error::ResolverError;
use crate::http::UpstreamResponse;

type DedupResult = Result<UpstreamResponse, ResolverError>;

enum WaitState {
    /// A fetch is in flight; subscribe to hear its outcome. The sender is
    /// held weakly so a cancelled leader is detected and replaced.
    Pending(Weak<broadcast::Sender<DedupResult>>),
    /// The fetch completed. Results stay for the life of the request, so
    /// late duplicates observe the stored response without a new call.
    Ready(DedupResult),
}

/// At most one physical call per fingerprint per request. Duplicate
/// logical calls either wait on the in-flight one or read the retained
/// result.
#[derive(Default)]
pub(crate) struct DedupMap {
    wait_map: Mutex<HashMap<Fingerprint, WaitState>>,
}

impl DedupMap {
    pub(crate) async fn load<F, Fut>(&self, fingerprint: Fingerprint, fetch: F) -> DedupResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DedupResult>,
    {
        let mut fetch = Some(fetch);
        loop {
            let mut wait_map = self.wait_map.lock().await;
            match wait_map.get(&fingerprint) {
                Some(WaitState::Ready(result)) => return result.clone(),
                Some(WaitState::Pending(weak_sender)) => {
                    let sender = match weak_sender.upgrade() {
                        Some(sender) => sender,
                        None => {
                            // The leader was cancelled; take over.
                            wait_map.remove(&fingerprint);
                            continue;
                        }
                    };
                    let mut receiver = sender.subscribe();
                    drop(wait_map);
                    match receiver.recv().await {
                        Ok(result) => return result,
                        // The sender dropped without publishing; retry.
                        Err(_) => continue,
                    }
                }
                None => {
                    let (sender, _guard) = broadcast::channel(1);
                    let sender = Arc::new(sender);
                    wait_map.insert(
                        fingerprint.clone(),
                        WaitState::Pending(Arc::downgrade(&sender)),
                    );
                    drop(wait_map);

                    let result = match fetch.take() {
                        Some(fetch) => fetch().await,
                        None => unreachable!("the leader branch runs at most once"),
                    };

                    let mut wait_map = self.wait_map.lock().await;
                    wait_map.insert(fingerprint, WaitState::Ready(result.clone()));
                    drop(wait_map);

                    // Waiters may have gone away; that is fine.
                    let _ = sender.send(result.clone());
                    return result;
                }
            }
        }
    }
}
