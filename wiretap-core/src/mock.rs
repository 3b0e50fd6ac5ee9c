//! The mock data model: a recorded exchange, the unit of replay.

use crate::resp::RespValue;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Protocol family of a recorded exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MockKind {
    Http,
    Grpc,
    Redis,
    /// Opaque passthrough traffic captured as raw bytes.
    Generic,
}

/// Replay bookkeeping attached to every mock.
///
/// Mocks live in exactly one of two partitions: filtered (candidates for the
/// next request of the recorded conversation) and unfiltered (consumed, or
/// fallback). `sort_order` preserves capture order across a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestModeInfo {
    pub is_filtered: bool,
    pub sort_order: i64,
}

/// A recorded exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mock {
    pub kind: MockKind,
    pub name: String,
    pub spec: MockSpec,
    pub test_mode_info: TestModeInfo,
}

/// Request and response of a single logical exchange, plus capture
/// timestamps, per protocol family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockSpec {
    Http(HttpSpec),
    Grpc(GrpcSpec),
    Redis(RedisSpec),
    Generic(GenericSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub request: HttpRequest,
    pub response: HttpResponse,
    #[serde(with = "time::serde::rfc3339")]
    pub request_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub response_at: OffsetDateTime,
}

/// A parsed HTTP/1.x request. The URL is stored normalized (fragment
/// stripped, query keys sorted); the body is stored decoded when
/// `Content-Encoding` named a compression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub version: String,
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub version: String,
    pub headers: Headers,
    #[serde(default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrpcSpec {
    /// Request header list in wire order, pseudo-headers first.
    pub request_headers: Headers,
    pub response_headers: Headers,
    pub trailers: Headers,
    pub request_messages: Vec<GrpcMessage>,
    pub response_messages: Vec<GrpcMessage>,
    #[serde(with = "time::serde::rfc3339")]
    pub request_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub response_at: OffsetDateTime,
}

/// One gRPC length-prefixed message: the wire flag byte, the raw payload,
/// and a schemaless text rendering of the payload for humans and diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrpcMessage {
    pub compression_flag: u8,
    pub data: Vec<u8>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisSpec {
    pub protocol_version: u8,
    pub requests: Vec<RespValue>,
    pub responses: Vec<RespValue>,
    #[serde(with = "time::serde::rfc3339")]
    pub request_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub response_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericSpec {
    pub request: Vec<u8>,
    pub response: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub request_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub response_at: OffsetDateTime,
}

impl Mock {
    pub fn new(kind: MockKind, name: impl Into<String>, spec: MockSpec, sort_order: i64) -> Self {
        Self {
            kind,
            name: name.into(),
            spec,
            test_mode_info: TestModeInfo {
                is_filtered: true,
                sort_order,
            },
        }
    }
}

/// Multi-valued headers with case-insensitive keys. Insertion order is
/// preserved; HTTP/2 pseudo-header ordering relies on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(pub Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// First value for `key`, case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// All values for `key`, in insertion order.
    pub fn all(&self, key: &str) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every value of `key` with a single value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.0.push((key.to_string(), value.into()));
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }

    /// Lowercased key set, with internal and caller-listed noise keys
    /// excluded. Matching compares these sets.
    pub fn key_set(&self, noise: &[String]) -> std::collections::BTreeSet<String> {
        self.0
            .iter()
            .map(|(k, _)| k.to_ascii_lowercase())
            .filter(|k| !wiretap_config::is_noise_header(k, noise))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// The content-type family: the media type without parameters, lowercased.
/// `application/json; charset=utf-8` and `application/json` are the same
/// family.
pub fn content_type_family(headers: &Headers) -> String {
    headers
        .get("content-type")
        .map(|ct| {
            ct.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase()
        })
        .unwrap_or_default()
}

/// Normalizes a request target: the fragment is stripped and query
/// parameters are sorted lexicographically. Idempotent, and equal for
/// equivalent URLs (`/x?b=2&a=1` and `/x?a=1&b=2` normalize identically).
pub fn normalize_url(target: &str) -> String {
    let without_fragment = match target.find('#') {
        Some(pos) => &target[..pos],
        None => target,
    };

    match without_fragment.find('?') {
        Some(pos) => {
            let path = &without_fragment[..pos];
            let query = &without_fragment[pos + 1..];
            if query.is_empty() {
                return path.to_string();
            }
            let mut params: Vec<&str> = query.split('&').collect();
            params.sort_unstable();
            format!("{}?{}", path, params.join("&"))
        }
        None => without_fragment.to_string(),
    }
}

/// Lowercased set of query parameter keys of a normalized or raw target.
pub fn query_key_set(target: &str) -> std::collections::BTreeSet<String> {
    let without_fragment = match target.find('#') {
        Some(pos) => &target[..pos],
        None => target,
    };
    match without_fragment.find('?') {
        Some(pos) => without_fragment[pos + 1..]
            .split('&')
            .filter(|p| !p.is_empty())
            .map(|p| {
                p.split('=')
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase()
            })
            .collect(),
        None => Default::default(),
    }
}

/// Path component of a request target, without query or fragment.
pub fn url_path(target: &str) -> &str {
    let end = target
        .find(|c| c == '?' || c == '#')
        .unwrap_or(target.len());
    &target[..end]
}
