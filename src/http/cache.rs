//! The process-wide cache of upstream GET responses.
//!
//! TTLs derive from response headers per RFC 7234: `max-age` wins over
//! `Expires`, `private`/`no-store` (and `max-age=0`) disable caching.
//! Entries carry their own time-to-live; failures are never stored.

use std::time::Duration;
use std::time::SystemTime;

use http::header::CACHE_CONTROL;
use http::header::EXPIRES;
use http::HeaderMap;

use super::UpstreamRequest;
use super::UpstreamResponse;
use crate::endpoint::Method;

type CacheKey = (Method, String);

#[derive(Clone)]
struct CachedEntry {
    response: UpstreamResponse,
    ttl: Duration,
}

struct PerEntryExpiry;

impl moka::Expiry<CacheKey, CachedEntry> for PerEntryExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        entry: &CachedEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Shared across every request; sits in front of the data loader so a hit
/// short-circuits even the fingerprint dedup.
pub struct HttpCache {
    entries: moka::sync::Cache<CacheKey, CachedEntry>,
}

impl HttpCache {
    pub fn new(capacity: u64) -> Self {
        HttpCache {
            entries: moka::sync::Cache::builder()
                .max_capacity(capacity)
                .expire_after(PerEntryExpiry)
                .build(),
        }
    }

    pub fn get(&self, request: &UpstreamRequest) -> Option<UpstreamResponse> {
        if request.method != Method::Get {
            return None;
        }
        self.entries
            .get(&(request.method, request.url.to_string()))
            .map(|entry| entry.response)
    }

    pub fn store(&self, request: &UpstreamRequest, response: &UpstreamResponse) {
        if request.method != Method::Get || !response.status.is_success() {
            return;
        }
        if let Some(ttl) = response_ttl(&response.headers, SystemTime::now()) {
            self.entries.insert(
                (request.method, request.url.to_string()),
                CachedEntry {
                    response: response.clone(),
                    ttl,
                },
            );
        }
    }
}

impl Default for HttpCache {
    fn default() -> Self {
        HttpCache::new(10_000)
    }
}

/// The freshness lifetime granted by a response's headers, or `None` when
/// the response must not be cached.
pub(crate) fn response_ttl(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    if let Some(value) = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
        let directives: Vec<&str> = value.split(',').map(str::trim).collect();
        if directives
            .iter()
            .any(|d| d.eq_ignore_ascii_case("private") || d.eq_ignore_ascii_case("no-store"))
        {
            return None;
        }
        if let Some(max_age) = directives.iter().find_map(|d| {
            d.strip_prefix("max-age=")
                .and_then(|seconds| seconds.trim().parse::<u64>().ok())
        }) {
            // max-age takes precedence over Expires, including max-age=0.
            return (max_age > 0).then(|| Duration::from_secs(max_age));
        }
    }

    let expires = headers.get(EXPIRES).and_then(|v| v.to_str().ok())?;
    // Invalid dates, including the common `Expires: -1`, disable caching.
    let expires_at = httpdate::parse_http_date(expires).ok()?;
    let ttl = expires_at.duration_since(now).ok()?;
    (!ttl.is_zero()).then_some(ttl)
}
