//! Cache entry and its on-disk metadata document.
//!
//! An entry is persisted as two artifacts sharing a key: `<key>.json`
//! (metadata) and `<key>.body` (raw bytes). Bodies are kept separate so they
//! can be edited by hand when crafting fixtures.

use std::collections::BTreeMap;
use std::io::Read;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use serde::{Deserialize, Serialize};

use crate::http::upstream::{is_hop_by_hop, ProxyRequest, UpstreamResponse};

/// Which tier served (or failed to serve) a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Version-controlled, read-only fixtures.
    #[serde(rename = "fixtures")]
    Fixtures,
    /// Writable recorded cache.
    #[serde(rename = "cache")]
    Recorded,
    /// No entry in either tier.
    #[serde(rename = "none")]
    None,
}

impl Tier {
    /// Value used in the `X-Proxy-Source` response marker.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fixtures => "fixtures",
            Tier::Recorded => "cache",
            Tier::None => "none",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored header value. Single values are written as plain strings so the
/// metadata stays easy to edit; repeated headers (e.g. `Set-Cookie`) as lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderField {
    One(String),
    Many(Vec<String>),
}

impl HeaderField {
    fn values(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            HeaderField::One(v) => std::slice::from_ref(v),
            HeaderField::Many(vs) => vs,
        };
        slice.iter().map(String::as_str)
    }
}

/// Header map as stored in the metadata document.
pub type StoredHeaders = BTreeMap<String, HeaderField>;

/// Request half of the metadata document. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachedRequest {
    pub method: String,
    pub url: String,
    pub headers: StoredHeaders,
}

/// Response half of the metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: StoredHeaders,
    /// The upstream body was content-encoded and has been decoded for storage.
    #[serde(default)]
    pub was_compressed: bool,
}

/// The `<key>.json` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(default)]
    pub request: CachedRequest,
    pub response: CachedResponse,
    #[serde(default)]
    pub recorded_at: DateTime<Utc>,
    #[serde(default)]
    pub cache_key: String,
}

/// A complete cache entry: metadata plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Normalized domain (directory name).
    pub domain: String,
    /// `{METHOD}_{hash12}` key (file stem).
    pub key: String,
    pub metadata: EntryMetadata,
    pub body: Bytes,
}

impl CacheEntry {
    /// Build an entry from a live exchange, decoding compressed bodies.
    pub fn capture(
        domain: impl Into<String>,
        key: impl Into<String>,
        request: &ProxyRequest,
        response: &UpstreamResponse,
    ) -> Self {
        let key = key.into();
        let (body, was_compressed) = decode_body(&response.headers, response.body.clone());

        let response_headers = store_headers(&response.headers, |name| {
            !is_hop_by_hop(name)
                && !(was_compressed
                    && (name == header::CONTENT_ENCODING || name == header::CONTENT_LENGTH))
        });
        let request_headers = store_headers(&request.headers, |name| {
            name == header::USER_AGENT || name == header::ACCEPT_LANGUAGE
        });

        Self {
            domain: domain.into(),
            key: key.clone(),
            metadata: EntryMetadata {
                request: CachedRequest {
                    method: request.method.to_string(),
                    url: request.url.to_string(),
                    headers: request_headers,
                },
                response: CachedResponse {
                    status: response.status.as_u16(),
                    headers: response_headers,
                    was_compressed,
                },
                recorded_at: Utc::now(),
                cache_key: key,
            },
            body,
        }
    }

    /// Stored status, or 502 when the document holds an impossible code.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.metadata.response.status).unwrap_or(StatusCode::BAD_GATEWAY)
    }

    /// Stored response headers ready to replay.
    ///
    /// Hop-by-hop headers and `Content-Length` are skipped; the length is
    /// recomputed from the body so hand-edited bodies stay consistent.
    pub fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, field) in &self.metadata.response.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                tracing::warn!(key = %self.key, header = %name, "Skipping invalid stored header name");
                continue;
            };
            if is_hop_by_hop(&name) || name == header::CONTENT_LENGTH {
                continue;
            }
            for value in field.values() {
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        headers.append(name.clone(), value);
                    }
                    Err(_) => {
                        tracing::warn!(key = %self.key, header = %name, "Skipping invalid stored header value");
                    }
                }
            }
        }
        headers
    }
}

fn store_headers(headers: &HeaderMap, keep: impl Fn(&HeaderName) -> bool) -> StoredHeaders {
    let mut stored = StoredHeaders::new();
    for name in headers.keys() {
        if !keep(name) {
            continue;
        }
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok().map(str::to_owned))
            .collect();
        let field = match values.len() {
            0 => continue,
            1 => HeaderField::One(values.into_iter().next().unwrap_or_default()),
            _ => HeaderField::Many(values),
        };
        stored.insert(name.as_str().to_owned(), field);
    }
    stored
}

/// Decode a `gzip` or `deflate` body. Returns the bytes to store and whether
/// decoding happened. Unknown encodings and corrupt streams are stored as-is.
fn decode_body(headers: &HeaderMap, body: Bytes) -> (Bytes, bool) {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());

    let mut decoded = Vec::new();
    let result = match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => MultiGzDecoder::new(&body[..]).read_to_end(&mut decoded),
        Some("deflate") => ZlibDecoder::new(&body[..]).read_to_end(&mut decoded),
        _ => return (body, false),
    };

    match result {
        Ok(_) => (Bytes::from(decoded), true),
        Err(e) => {
            tracing::warn!(error = %e, encoding = ?encoding, "Failed to decode upstream body, storing raw bytes");
            (body, false)
        }
    }
}
