//! Live fetches against the origin.
//!
//! # Responsibilities
//! - Forward a buffered request to the origin with hop-by-hop and proxy
//!   headers removed
//! - Buffer the full response so it can be stored and replayed
//! - Map failures to a cloneable `FetchError` shared by coalesced waiters
//!
//! # Design Decisions
//! - Redirects are not followed; the client sees the origin's 3xx
//! - The client never uses a system proxy (it would loop back into us)
//! - One timeout covers connect, headers and body
//! - Extra PEM roots can be trusted for origins behind a private CA

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use metrics::counter;
use thiserror::Error;
use url::Url;

/// A request as the proxy will forward it.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A fully buffered origin response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Live fetch failure. Cheap to clone so one outcome can reach every waiter.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("live fetch timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("live fetch failed: {0}")]
    Upstream(Arc<str>),

    #[error("failed to read upstream response: {0}")]
    Body(Arc<str>),
}

/// Failure to load an extra origin root certificate.
#[derive(Debug, Error)]
pub enum OriginRootError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no PEM certificate in {}", path.display())]
    NoCertificate { path: PathBuf },

    #[error("invalid PEM certificate in {}: {source}", path.display())]
    Invalid {
        path: PathBuf,
        #[source]
        source: reqwest::Error,
    },
}

/// Read one PEM certificate per path.
pub fn load_origin_roots(paths: &[PathBuf]) -> Result<Vec<reqwest::Certificate>, OriginRootError> {
    paths.iter().map(|path| load_origin_root(path)).collect()
}

fn load_origin_root(path: &Path) -> Result<reqwest::Certificate, OriginRootError> {
    let pem = std::fs::read(path).map_err(|source| OriginRootError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parsed: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    if parsed.is_empty() || parsed.iter().any(Result::is_err) {
        return Err(OriginRootError::NoCertificate {
            path: path.to_path_buf(),
        });
    }
    reqwest::Certificate::from_pem(&pem).map_err(|source| OriginRootError::Invalid {
        path: path.to_path_buf(),
        source,
    })
}

/// Connection-scoped headers never forwarded in either direction.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn forwardable(name: &HeaderName) -> bool {
    !is_hop_by_hop(name)
        && name != header::HOST
        && name != header::CONTENT_LENGTH
        && !name.as_str().starts_with("proxy-")
        && !name.as_str().starts_with("x-proxy-")
}

/// Render an error with its source chain, `reqwest` hides the useful part there.
fn describe(err: &(dyn std::error::Error + 'static)) -> Arc<str> {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message.into()
}

/// HTTP client for origin fetches.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: reqwest::Client,
    timeout: Duration,
}

impl Upstream {
    /// Build the origin client, trusting `extra_roots` alongside the built-in roots.
    pub fn new(timeout: Duration, extra_roots: &[reqwest::Certificate]) -> Result<Self, reqwest::Error> {
        let builder = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout);
        let client = extra_roots
            .iter()
            .cloned()
            .fold(builder, |builder, root| builder.add_root_certificate(root))
            .build()?;
        Ok(Self { client, timeout })
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    fn map_error(&self, err: reqwest::Error, body: bool) -> FetchError {
        if err.is_timeout() {
            return FetchError::Timeout {
                secs: self.timeout_secs(),
            };
        }
        let message = describe(&err);
        if body {
            FetchError::Body(message)
        } else {
            FetchError::Upstream(message)
        }
    }

    /// Fetch `request` from its origin and buffer the response.
    pub async fn fetch(&self, request: &ProxyRequest) -> Result<UpstreamResponse, FetchError> {
        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            if forwardable(name) {
                headers.append(name.clone(), value.clone());
            }
        }

        tracing::debug!(method = %request.method, url = %request.url, "Fetching from origin");

        let result = async {
            let response = self
                .client
                .request(request.method.clone(), request.url.clone())
                .headers(headers)
                .body(request.body.clone())
                .send()
                .await
                .map_err(|e| self.map_error(e, false))?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| self.map_error(e, true))?;
            Ok::<_, FetchError>(UpstreamResponse {
                status,
                headers,
                body,
            })
        }
        .await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(FetchError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        counter!("replay_proxy_live_fetches_total", "outcome" => outcome).increment(1);

        if let Err(e) = &result {
            tracing::warn!(url = %request.url, error = %e, "Live fetch failed");
        }
        result
    }
}
