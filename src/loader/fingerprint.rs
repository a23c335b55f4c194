//! The canonical identity of an upstream request, used as the dedup key.

use bytes::Bytes;

use crate::endpoint::Method;
use crate::http::UpstreamRequest;

/// `(method, url, headers, body)` in canonical form: query pairs and
/// headers are sorted so that two requests that differ only in ordering
/// collapse onto one key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Fingerprint {
    pub fn of(request: &UpstreamRequest) -> Fingerprint {
        let mut url = request.url.clone();
        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();
        {
            let mut serializer = url.query_pairs_mut();
            serializer.clear();
            for (key, value) in &pairs {
                serializer.append_pair(key, value);
            }
        }
        if pairs.is_empty() {
            url.set_query(None);
        }

        let mut headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        headers.sort();

        Fingerprint {
            method: request.method,
            url: url.to_string(),
            headers,
            body: request.body.clone(),
        }
    }
}
