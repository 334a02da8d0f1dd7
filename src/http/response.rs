//! Response construction and failure mapping.
//!
//! # Responsibilities
//! - Attach `X-Proxy-*` marker headers describing how a response was produced
//! - Replay stored and fetched exchanges with hop-by-hop headers removed
//! - Map every proxy and admin failure to its HTTP status and JSON body
//!
//! # Status Mapping
//! - cache miss in replay → 502 `{"error": "cache_miss", ...}`
//! - live fetch timeout → 504 `{"error": "timeout", ...}`
//! - live fetch failure → 502 `{"error": "live_fetch_failed", ...}`
//! - invalid mode / domain / request → 400

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde_json::json;

use crate::cache::{CacheError, Tier};
use crate::http::upstream::{is_hop_by_hop, FetchError};
use crate::mode::{InvalidMode, Mode};

pub static X_PROXY_MODE: HeaderName = HeaderName::from_static("x-proxy-mode");
pub static X_PROXY_SOURCE: HeaderName = HeaderName::from_static("x-proxy-source");
pub static X_PROXY_CACHE_MISS: HeaderName = HeaderName::from_static("x-proxy-cache-miss");
pub static X_PROXY_CACHE_WRITE: HeaderName = HeaderName::from_static("x-proxy-cache-write");
pub static X_PROXY_FALLBACK: HeaderName = HeaderName::from_static("x-proxy-fallback");

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Tier(Tier),
    Live,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Tier(tier) => tier.as_str(),
            Source::Live => "live",
        }
    }
}

/// Marker headers describing how a response was produced.
#[derive(Debug, Clone, Copy)]
pub struct Markers {
    pub mode: Mode,
    pub source: Source,
    pub hybrid_fallback: bool,
    pub cache_write_failed: bool,
}

impl Markers {
    pub fn new(mode: Mode, source: Source) -> Self {
        Self {
            mode,
            source,
            hybrid_fallback: false,
            cache_write_failed: false,
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(
            X_PROXY_MODE.clone(),
            HeaderValue::from_static(self.mode.as_str()),
        );
        headers.insert(
            X_PROXY_SOURCE.clone(),
            HeaderValue::from_static(self.source.as_str()),
        );
        if self.hybrid_fallback {
            headers.insert(X_PROXY_FALLBACK.clone(), HeaderValue::from_static("hybrid"));
        }
        if self.cache_write_failed {
            headers.insert(X_PROXY_CACHE_WRITE.clone(), HeaderValue::from_static("failed"));
        }
    }
}

/// Build a client response from a status, headers and a complete body.
///
/// Hop-by-hop headers and any stale `Content-Length` are dropped; the
/// length is set from the body.
pub fn replay(status: StatusCode, headers: &HeaderMap, body: Bytes, markers: Markers) -> Response {
    let mut out = HeaderMap::with_capacity(headers.len() + 4);
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    markers.apply(&mut out);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = out;
    response
}

/// A request the proxy could not serve.
#[derive(Debug)]
pub enum ProxyFailure {
    /// Replay mode without hybrid fallback found nothing in either tier.
    CacheMiss { url: String, cache_key: String },
    /// The live fetch failed or timed out.
    Fetch {
        url: String,
        mode: Mode,
        error: FetchError,
    },
    /// The request cannot be proxied at all (no host, bad URL, body too large).
    BadRequest(String),
}

impl IntoResponse for ProxyFailure {
    fn into_response(self) -> Response {
        match self {
            ProxyFailure::CacheMiss { url, cache_key } => {
                let body = json!({
                    "error": "cache_miss",
                    "mode": Mode::Replay,
                    "url": url,
                    "cache_key": cache_key,
                    "message": "No fixture or recording found. Switch to record mode or enable hybrid fallback to capture this URL.",
                });
                let mut response = (StatusCode::BAD_GATEWAY, Json(body)).into_response();
                Markers::new(Mode::Replay, Source::Tier(Tier::None)).apply(response.headers_mut());
                response
                    .headers_mut()
                    .insert(X_PROXY_CACHE_MISS.clone(), HeaderValue::from_static("true"));
                response
            }
            ProxyFailure::Fetch { url, mode, error } => {
                let (status, body) = match &error {
                    FetchError::Timeout { secs } => (
                        StatusCode::GATEWAY_TIMEOUT,
                        json!({
                            "error": "timeout",
                            "url": url,
                            "timeout_seconds": secs,
                        }),
                    ),
                    other => (
                        StatusCode::BAD_GATEWAY,
                        json!({
                            "error": "live_fetch_failed",
                            "url": url,
                            "message": other.to_string(),
                        }),
                    ),
                };
                let mut response = (status, Json(body)).into_response();
                Markers::new(mode, Source::Tier(Tier::None)).apply(response.headers_mut());
                response
            }
            ProxyFailure::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "bad_request", "message": message })),
            )
                .into_response(),
        }
    }
}

/// Admin surface failure.
#[derive(Debug)]
pub enum ApiError {
    InvalidMode(InvalidMode),
    InvalidDomain(String),
    Cache(CacheError),
}

impl From<InvalidMode> for ApiError {
    fn from(err: InvalidMode) -> Self {
        ApiError::InvalidMode(err)
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::InvalidName(name) => ApiError::InvalidDomain(name),
            other => ApiError::Cache(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::InvalidMode(err) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "invalid_mode",
                    "message": format!("Invalid mode: {}. Valid modes: replay, record, live, hybrid", err.0),
                }),
            ),
            ApiError::InvalidDomain(domain) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_domain", "domain": domain }),
            ),
            ApiError::Cache(err) => {
                tracing::error!(error = %err, "Admin cache operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "cache_error", "message": err.to_string() }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn cache_miss_shape() {
        let response = ProxyFailure::CacheMiss {
            url: "https://notfound.example.com/missing".into(),
            cache_key: "GET_0123456789ab".into(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let headers = response.headers();
        assert_eq!(headers[&X_PROXY_MODE], "replay");
        assert_eq!(headers[&X_PROXY_SOURCE], "none");
        assert_eq!(headers[&X_PROXY_CACHE_MISS], "true");

        let body = json_body(response).await;
        assert_eq!(body["error"], "cache_miss");
        assert_eq!(body["mode"], "replay");
        assert_eq!(body["cache_key"], "GET_0123456789ab");
        assert_eq!(body["url"], "https://notfound.example.com/missing");
        assert!(body["message"].as_str().unwrap().contains("record"));
    }

    #[tokio::test]
    async fn timeout_is_504() {
        let response = ProxyFailure::Fetch {
            url: "http://slow.example.com/".into(),
            mode: Mode::Live,
            error: FetchError::Timeout { secs: 30 },
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = json_body(response).await;
        assert_eq!(body["error"], "timeout");
        assert_eq!(body["timeout_seconds"], 30);
    }

    #[tokio::test]
    async fn fetch_failure_carries_message() {
        let response = ProxyFailure::Fetch {
            url: "http://down.example.com/".into(),
            mode: Mode::Record,
            error: FetchError::Upstream("connection refused".into()),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers()[&X_PROXY_MODE], "record");
        let body = json_body(response).await;
        assert_eq!(body["error"], "live_fetch_failed");
        assert!(body["message"].as_str().unwrap().contains("connection refused"));
    }

    #[test]
    fn replay_strips_framing_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("999"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/html"));

        let mut markers = Markers::new(Mode::Replay, Source::Tier(Tier::Fixtures));
        markers.hybrid_fallback = true;
        let response = replay(StatusCode::OK, &headers, Bytes::from_static(b"hi"), markers);

        let headers = response.headers();
        assert!(headers.get(header::CONTENT_LENGTH).is_none());
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
        assert_eq!(headers[&X_PROXY_SOURCE], "fixtures");
        assert_eq!(headers[&X_PROXY_FALLBACK], "hybrid");
        assert_eq!(headers[header::CONTENT_TYPE], "text/html");
    }

    #[tokio::test]
    async fn invalid_mode_is_400() {
        let response = ApiError::from(InvalidMode("turbo".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_mode");
    }
}
