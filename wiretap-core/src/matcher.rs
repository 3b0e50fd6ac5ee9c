//! Mock matching: a cascade that stops at the first hit, then consumes the
//! chosen mock with a compare-and-swap against the store. A lost CAS
//! restarts the cascade on a fresh snapshot.

use crate::mock::{Mock, MockKind, MockSpec, content_type_family, query_key_set, url_path};
use crate::mock::{Headers, HttpRequest, normalize_url};
use crate::resp::{RespValue, structurally_equal};
use crate::store::MockStore;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// The reduced representation of a live request used for matching.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub method: String,
    pub path: String,
    pub content_type_family: String,
    pub query_keys: BTreeSet<String>,
    pub header_keys: BTreeSet<String>,
    pub body: Vec<u8>,
}

impl Fingerprint {
    pub fn from_http(request: &HttpRequest, noise: &[String]) -> Self {
        let normalized = normalize_url(&request.url);
        Self {
            method: request.method.clone(),
            path: url_path(&normalized).to_string(),
            content_type_family: content_type_family(&request.headers),
            query_keys: query_key_set(&normalized),
            header_keys: request.headers.key_set(noise),
            body: request.body.clone(),
        }
    }

    /// gRPC requests always travel as POST with a `application/grpc*`
    /// content type; the body is the concatenation of the length-prefixed
    /// message payloads.
    pub fn from_grpc(request_headers: &Headers, body: Vec<u8>, noise: &[String]) -> Self {
        let path = request_headers.get(":path").unwrap_or("/").to_string();
        Self {
            method: request_headers
                .get(":method")
                .unwrap_or("POST")
                .to_string(),
            path: url_path(&normalize_url(&path)).to_string(),
            content_type_family: content_type_family(request_headers),
            query_keys: query_key_set(&path),
            header_keys: request_headers.key_set(noise),
            body,
        }
    }
}

pub struct Matcher {
    store: Arc<MockStore>,
    noise: Vec<String>,
}

impl Matcher {
    pub fn new(store: Arc<MockStore>, noise: Vec<String>) -> Self {
        Self { store, noise }
    }

    /// Returns a consumed mock to the filtered partition. Called when a
    /// task is terminated after winning the CAS but before the response
    /// reached the client.
    pub fn restore(&self, mock: &Mock) -> bool {
        self.store.restore(mock)
    }

    /// Runs the cascade for HTTP-shaped kinds (HTTP and gRPC) over the
    /// filtered candidates. Returns the consumed mock on a hit, `None` on a
    /// genuine miss. A mock is delivered at most once: a CAS loser re-enters
    /// against a fresh snapshot where the winner's mock is no longer a
    /// candidate.
    pub fn match_request(&self, fingerprint: &Fingerprint, kind: MockKind) -> Option<Mock> {
        loop {
            let snapshot = self.store.snapshot();
            let candidates: Vec<&Mock> = snapshot
                .filtered
                .iter()
                .filter(|m| m.kind == kind)
                .collect();

            match self.cascade(fingerprint, &candidates) {
                Some(chosen) => {
                    if self.store.cas(chosen, chosen.clone()) {
                        return Some(chosen.clone());
                    }
                    // Lost the race; another task consumed it. Retry on a
                    // fresh snapshot.
                    debug!(mock = %chosen.name, "CAS lost, restarting cascade");
                    continue;
                }
                None => return None,
            }
        }
    }

    /// Structural matching for Redis: schema steps do not apply, equality is
    /// a deep comparison of the parsed value trees.
    pub fn match_redis(&self, requests: &[RespValue]) -> Option<Mock> {
        loop {
            let snapshot = self.store.snapshot();
            let chosen = snapshot
                .filtered
                .iter()
                .filter(|m| m.kind == MockKind::Redis)
                .find(|m| redis_requests_equal(m, requests));

            match chosen {
                Some(chosen) => {
                    if self.store.cas(chosen, chosen.clone()) {
                        return Some(chosen.clone());
                    }
                    continue;
                }
                None => return None,
            }
        }
    }

    /// Schema filter, then exact body, then JSON key-set, then fuzzy.
    fn cascade<'a>(&self, fingerprint: &Fingerprint, candidates: &[&'a Mock]) -> Option<&'a Mock> {
        let survivors: Vec<&Mock> = candidates
            .iter()
            .copied()
            .filter(|m| self.schema_matches(fingerprint, m))
            .collect();
        if survivors.is_empty() {
            return None;
        }

        // Exact body equality.
        let exact: Vec<&Mock> = survivors
            .iter()
            .copied()
            .filter(|m| mock_body(m) == fingerprint.body.as_slice())
            .collect();
        if exact.len() == 1 {
            return Some(exact[0]);
        }

        // JSON key-set containment: every top-level key of the mock body
        // must appear in the request body.
        let survivors = if let Ok(serde_json::Value::Object(request_keys)) =
            serde_json::from_slice::<serde_json::Value>(&fingerprint.body)
        {
            let json_survivors: Vec<&Mock> = survivors
                .iter()
                .copied()
                .filter(|m| {
                    match serde_json::from_slice::<serde_json::Value>(mock_body(m)) {
                        Ok(serde_json::Value::Object(mock_keys)) => {
                            mock_keys.keys().all(|k| request_keys.contains_key(k))
                        }
                        _ => false,
                    }
                })
                .collect();
            match json_survivors.len() {
                1 => return Some(json_survivors[0]),
                0 => survivors,
                _ => json_survivors,
            }
        } else {
            survivors
        };

        self.fuzzy(fingerprint, &survivors)
    }

    fn schema_matches(&self, fingerprint: &Fingerprint, mock: &Mock) -> bool {
        let (method, url, headers) = match &mock.spec {
            MockSpec::Http(spec) => (
                spec.request.method.as_str(),
                spec.request.url.as_str(),
                &spec.request.headers,
            ),
            MockSpec::Grpc(spec) => (
                spec.request_headers.get(":method").unwrap_or("POST"),
                spec.request_headers.get(":path").unwrap_or("/"),
                &spec.request_headers,
            ),
            _ => return false,
        };

        let normalized = normalize_url(url);
        if method != fingerprint.method {
            return false;
        }
        if url_path(&normalized) != fingerprint.path {
            return false;
        }
        if content_type_family(headers) != fingerprint.content_type_family {
            return false;
        }
        if query_key_set(&normalized) != fingerprint.query_keys {
            return false;
        }
        // Extra request headers beyond the mock's keys are allowed.
        headers
            .key_set(&self.noise)
            .is_subset(&fingerprint.header_keys)
    }

    fn fuzzy<'a>(&self, fingerprint: &Fingerprint, survivors: &[&'a Mock]) -> Option<&'a Mock> {
        if survivors.is_empty() {
            return None;
        }
        if fingerprint.body.is_ascii() {
            let request = String::from_utf8_lossy(&fingerprint.body);
            let mut best: Option<(usize, &Mock)> = None;
            for mock in survivors {
                let candidate = String::from_utf8_lossy(mock_body(mock));
                let distance = strsim::levenshtein(&request, &candidate);
                if distance == 0 {
                    return Some(mock);
                }
                if best.map(|(d, _)| distance < d).unwrap_or(true) {
                    best = Some((distance, mock));
                }
            }
            best.map(|(_, m)| m)
        } else {
            let k = shingle_size(fingerprint.body.len());
            let request_shingles = shingles(&fingerprint.body, k);
            let mut best: Option<(f64, &Mock)> = None;
            for mock in survivors {
                let similarity = jaccard(&request_shingles, &shingles(mock_body(mock), k));
                if best.map(|(s, _)| similarity > s).unwrap_or(true) {
                    best = Some((similarity, mock));
                }
            }
            best.map(|(_, m)| m)
        }
    }
}

fn mock_body(mock: &Mock) -> &[u8] {
    match &mock.spec {
        MockSpec::Http(spec) => &spec.request.body,
        MockSpec::Grpc(spec) => grpc_body(&spec.request_messages),
        _ => &[],
    }
}

fn grpc_body(messages: &[crate::mock::GrpcMessage]) -> &[u8] {
    // A unary call has exactly one message; matching compares its payload.
    messages.first().map(|m| m.data.as_slice()).unwrap_or(&[])
}

fn redis_requests_equal(mock: &Mock, requests: &[RespValue]) -> bool {
    match &mock.spec {
        MockSpec::Redis(spec) => {
            spec.requests.len() == requests.len()
                && spec
                    .requests
                    .iter()
                    .zip(requests)
                    .all(|(a, b)| structurally_equal(a, b))
        }
        _ => false,
    }
}

/// Shingle width adapts to the body length: short bodies get fine-grained
/// shingles, long bodies coarser ones.
fn shingle_size(len: usize) -> usize {
    match len {
        0..=128 => 3,
        129..=512 => 4,
        513..=2048 => 5,
        2049..=8192 => 6,
        8193..=32768 => 7,
        _ => 8,
    }
}

fn shingles(data: &[u8], k: usize) -> HashSet<&[u8]> {
    if data.len() < k {
        return std::iter::once(data).collect();
    }
    data.windows(k).collect()
}

fn jaccard(a: &HashSet<&[u8]>, b: &HashSet<&[u8]>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}
