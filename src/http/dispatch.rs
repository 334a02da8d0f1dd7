//! Mode-aware request dispatch.
//!
//! # Data Flow
//! ```text
//! absolute-form request  → handle_absolute ─┐
//! origin-form (Host hdr) → handle_origin ───┼→ dispatch
//! in-tunnel request      → handle_tunneled ─┘     │
//!                                                 ├→ Live: fetch, serve, no cache
//!                                                 └→ Replay/Record: lookup
//!                                                      ├→ hit: serve stored entry
//!                                                      ├→ miss + Replay: cache_miss failure
//!                                                      └→ miss + Record / hybrid: coalesced fetch → store → serve
//! ```
//!
//! # Design Decisions
//! - The mode is resolved once per request; later changes do not affect it
//! - Storage failures never hide the fetched response, they are flagged on it

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::{header, Request},
    response::{IntoResponse, Response},
};
use url::Url;

use crate::cache::{
    generate_key, normalize_domain, CacheEntry, CacheStore, Coalescer, Lookup,
};
use crate::http::response::{replay, Markers, ProxyFailure, Source, X_PROXY_SOURCE};
use crate::http::upstream::{FetchError, ProxyRequest, Upstream};
use crate::mode::{Mode, ModeManager, Resolved};
use crate::observability::metrics;

/// Result of a coalesced fetch-and-store, shared by every waiter.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub entry: Arc<CacheEntry>,
    /// Set when the entry could not be persisted.
    pub persist_error: Option<Arc<str>>,
}

pub type FetchOutcome = Result<Fetched, FetchError>;

/// Where an intercepted tunnel points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    /// Parse a CONNECT authority (`host:port`, port defaults to 443).
    pub fn parse(authority: &str) -> Option<Self> {
        let url = Url::parse(&format!("https://{authority}")).ok()?;
        let host = url.host_str()?.to_string();
        Some(Self {
            host,
            port: url.port().unwrap_or(443),
        })
    }

    fn url_for(&self, path_and_query: &str) -> Result<Url, url::ParseError> {
        if self.port == 443 {
            Url::parse(&format!("https://{}{}", self.host, path_and_query))
        } else {
            Url::parse(&format!("https://{}:{}{}", self.host, self.port, path_and_query))
        }
    }
}

impl std::fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Serves requests according to the effective mode of their domain.
pub struct Dispatcher {
    modes: Arc<ModeManager>,
    store: Arc<CacheStore>,
    upstream: Upstream,
    coalescer: Coalescer<FetchOutcome>,
    max_body_bytes: usize,
}

impl Dispatcher {
    pub fn new(
        modes: Arc<ModeManager>,
        store: Arc<CacheStore>,
        upstream: Upstream,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            modes,
            store,
            upstream,
            coalescer: Coalescer::new(),
            max_body_bytes,
        }
    }

    /// Number of live fetches currently shared through the coalescer.
    pub fn in_flight(&self) -> usize {
        self.coalescer.in_flight()
    }

    /// Forward-proxy request with an absolute URI (`GET http://host/path`).
    pub async fn handle_absolute(&self, request: Request<Body>) -> Response {
        let url = match Url::parse(&request.uri().to_string()) {
            Ok(url) => url,
            Err(e) => return ProxyFailure::BadRequest(format!("invalid request URL: {e}")).into_response(),
        };
        self.handle_with_url(request, url).await
    }

    /// Origin-form request addressed by its `Host` header, fetched over plain HTTP.
    pub async fn handle_origin(&self, request: Request<Body>) -> Response {
        let Some(host) = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
        else {
            return ProxyFailure::BadRequest("missing Host header".into()).into_response();
        };
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = match Url::parse(&format!("http://{host}{path}")) {
            Ok(url) => url,
            Err(e) => return ProxyFailure::BadRequest(format!("invalid request URL: {e}")).into_response(),
        };
        self.handle_with_url(request, url).await
    }

    /// Decrypted request from an intercepted CONNECT tunnel.
    pub async fn handle_tunneled(&self, target: &TunnelTarget, request: Request<Body>) -> Response {
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = match target.url_for(path) {
            Ok(url) => url,
            Err(e) => return ProxyFailure::BadRequest(format!("invalid request URL: {e}")).into_response(),
        };
        self.handle_with_url(request, url).await
    }

    async fn handle_with_url(&self, request: Request<Body>, url: Url) -> Response {
        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(e) => {
                return ProxyFailure::BadRequest(format!("failed to read request body: {e}"))
                    .into_response()
            }
        };
        self.dispatch(ProxyRequest {
            method: parts.method,
            url,
            headers: parts.headers,
            body,
        })
        .await
    }

    /// Serve one request under its domain's effective mode.
    pub async fn dispatch(&self, request: ProxyRequest) -> Response {
        let start = Instant::now();
        let Some(host) = request.url.host_str() else {
            return ProxyFailure::BadRequest(format!("request URL has no host: {}", request.url))
                .into_response();
        };

        let domain = normalize_domain(host);
        let key = generate_key(&request.method, &request.url, &request.headers);
        let resolved = self.modes.resolve(&domain);

        tracing::debug!(
            domain = %domain,
            cache_key = %key,
            mode = %resolved.mode,
            hybrid = resolved.hybrid_fallback,
            url = %request.url,
            "Dispatching request"
        );

        let response = match resolved.mode {
            Mode::Live => self.serve_live(request).await,
            Mode::Replay | Mode::Record => self.serve_cached(request, domain, key, resolved).await,
        };

        let source = response
            .headers()
            .get(&X_PROXY_SOURCE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");
        metrics::record_request(resolved.mode, source, response.status().as_u16(), start);
        response
    }

    async fn serve_live(&self, request: ProxyRequest) -> Response {
        match self.upstream.fetch(&request).await {
            Ok(upstream) => replay(
                upstream.status,
                &upstream.headers,
                upstream.body,
                Markers::new(Mode::Live, Source::Live),
            ),
            Err(error) => ProxyFailure::Fetch {
                url: request.url.to_string(),
                mode: Mode::Live,
                error,
            }
            .into_response(),
        }
    }

    async fn serve_cached(
        &self,
        request: ProxyRequest,
        domain: String,
        key: String,
        resolved: Resolved,
    ) -> Response {
        match self.store.lookup(&domain, &key).await {
            Ok(Lookup::Hit { entry, tier }) => {
                metrics::record_lookup(tier);
                tracing::debug!(domain = %domain, cache_key = %key, tier = %tier, "Cache hit");
                return replay(
                    entry.status(),
                    &entry.response_headers(),
                    entry.body.clone(),
                    Markers::new(resolved.mode, Source::Tier(tier)),
                );
            }
            Ok(Lookup::Miss) => {}
            Err(e) => {
                tracing::warn!(domain = %domain, cache_key = %key, error = %e, "Cache lookup failed, treating as miss");
            }
        }
        metrics::record_lookup(crate::cache::Tier::None);

        let fallback = resolved.mode == Mode::Replay;
        if fallback && !resolved.hybrid_fallback {
            tracing::info!(domain = %domain, cache_key = %key, url = %request.url, "Cache miss in replay mode");
            return ProxyFailure::CacheMiss {
                url: request.url.to_string(),
                cache_key: key,
            }
            .into_response();
        }

        let url = request.url.to_string();
        match self.fetch_and_store(request, domain, key).await {
            Ok(fetched) => {
                let mut markers = Markers::new(
                    resolved.mode,
                    if fetched.persist_error.is_some() {
                        Source::Live
                    } else {
                        Source::Tier(crate::cache::Tier::Recorded)
                    },
                );
                markers.hybrid_fallback = fallback;
                markers.cache_write_failed = fetched.persist_error.is_some();
                replay(
                    fetched.entry.status(),
                    &fetched.entry.response_headers(),
                    fetched.entry.body.clone(),
                    markers,
                )
            }
            Err(error) => ProxyFailure::Fetch {
                url,
                mode: resolved.mode,
                error,
            }
            .into_response(),
        }
    }

    /// One live fetch per `domain/key`; concurrent callers share its outcome.
    async fn fetch_and_store(&self, request: ProxyRequest, domain: String, key: String) -> FetchOutcome {
        let coalesce_key = format!("{domain}/{key}");
        let upstream = self.upstream.clone();
        let store = self.store.clone();

        self.coalescer
            .run(&coalesce_key, move || async move {
                let response = upstream.fetch(&request).await?;
                let entry = CacheEntry::capture(domain, key, &request, &response);
                let persist_error = match store.store(&entry).await {
                    Ok(()) => {
                        tracing::info!(
                            domain = %entry.domain,
                            cache_key = %entry.key,
                            status = response.status.as_u16(),
                            "Recorded response"
                        );
                        None
                    }
                    Err(e) => {
                        tracing::error!(
                            domain = %entry.domain,
                            cache_key = %entry.key,
                            error = %e,
                            "Failed to persist cache entry"
                        );
                        Some(Arc::<str>::from(e.to_string()))
                    }
                };
                Ok::<_, FetchError>(Fetched {
                    entry: Arc::new(entry),
                    persist_error,
                })
            })
            .await
    }
}
