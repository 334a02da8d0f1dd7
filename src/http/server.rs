//! HTTP server setup and the top-level service.
//!
//! # Responsibilities
//! - Build the shared state (modes, stores, dispatcher, interceptor)
//! - Accept connections from the bounded listener
//! - Serve each connection with hyper, upgrades enabled for CONNECT
//! - Split traffic: CONNECT → interceptor, absolute URI → dispatcher,
//!   origin-form → admin router with the dispatcher as fallback
//! - Stop accepting on shutdown and drain open connections
//!
//! # Design Decisions
//! - One port carries proxy and admin traffic
//! - Request IDs and trace spans wrap every request, including CONNECT

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request},
    response::Response,
    Router,
};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::admin::admin_router;
use crate::cache::CacheStore;
use crate::config::ProxyConfig;
use crate::error::ServerError;
use crate::http::dispatch::Dispatcher;
use crate::http::request::{request_id_layers, RequestSpan};
use crate::http::upstream::{load_origin_roots, Upstream};
use crate::mode::{ModeManager, ModeSelection};
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{ConnectionPermit, Listener};
use crate::net::tls::load_acceptor;
use crate::net::tunnel::Interceptor;

/// Application state shared by the admin handlers and the proxy path.
#[derive(Clone)]
pub struct AppState {
    pub modes: Arc<ModeManager>,
    pub store: Arc<CacheStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub interceptor: Arc<Interceptor>,
    pub tracker: ConnectionTracker,
}

/// The intercepting proxy server.
pub struct HttpServer {
    state: AppState,
    router: Router,
    shutdown_timeout: Duration,
}

impl HttpServer {
    /// Build every subsystem from a validated configuration.
    pub fn new(config: &ProxyConfig) -> Result<Self, ServerError> {
        let selection: ModeSelection = config.mode.initial.parse()?;
        let hybrid = config.mode.hybrid_fallback || selection == ModeSelection::Hybrid;
        let modes = Arc::new(ModeManager::new(
            selection.mode(),
            hybrid,
            config.audit.capacity,
        ));

        let store = Arc::new(CacheStore::new(
            &config.cache.fixtures_dir,
            &config.cache.cache_dir,
        ));
        let origin_roots = load_origin_roots(&config.upstream.ca_certs)?;
        let upstream = Upstream::new(Duration::from_secs(config.timeouts.live_secs), &origin_roots)?;
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&modes),
            Arc::clone(&store),
            upstream,
            config.limits.max_body_bytes,
        ));

        let acceptor = config
            .tls
            .as_ref()
            .map(|tls| load_acceptor(&tls.cert_path, &tls.key_path))
            .transpose()?;
        let tracker = ConnectionTracker::new();
        let interceptor = Arc::new(Interceptor::new(
            acceptor,
            Arc::clone(&dispatcher),
            tracker.clone(),
        ));

        tracing::info!(
            mode = %selection.mode(),
            hybrid_fallback = hybrid,
            fixtures_dir = %config.cache.fixtures_dir.display(),
            cache_dir = %config.cache.cache_dir.display(),
            tls_interception = interceptor.intercepts(),
            "Proxy state initialized"
        );

        let state = AppState {
            modes,
            store,
            dispatcher,
            interceptor,
            tracker,
        };
        let router = admin_router(state.clone());

        Ok(Self {
            state,
            router,
            shutdown_timeout: Duration::from_secs(config.timeouts.shutdown_secs),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Accept and serve connections until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr().ok();
        tracing::info!(address = ?addr, "Replay proxy accepting connections");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer, permit)) => {
                            self.spawn_connection(stream, peer, permit, shutdown.resubscribe());
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }
        drop(listener);

        let active = self.state.tracker.active_count();
        if active > 0 {
            tracing::info!(active, deadline = ?self.shutdown_timeout, "Draining connections");
        }
        if !self.state.tracker.drain(self.shutdown_timeout).await {
            tracing::warn!(
                remaining = self.state.tracker.active_count(),
                "Drain deadline passed, closing remaining connections"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    fn spawn_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        permit: ConnectionPermit,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let guard = self.state.tracker.track();
        let state = self.state.clone();
        let router = self.router.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let service = request_id_layers()
                .layer(TraceLayer::new_for_http().make_span_with(RequestSpan))
                .service_fn(move |request: Request<Incoming>| {
                    let state = state.clone();
                    let router = router.clone();
                    async move { Ok::<_, Infallible>(route(&state, router, request.map(Body::new)).await) }
                });

            let connection = hyper::server::conn::http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service))
                .with_upgrades();
            tokio::pin!(connection);

            let result = tokio::select! {
                result = connection.as_mut() => result,
                _ = shutdown.recv() => {
                    connection.as_mut().graceful_shutdown();
                    connection.as_mut().await
                }
            };
            if let Err(e) = result {
                tracing::debug!(connection_id = %guard.id(), peer = %peer, error = %e, "Connection ended with error");
            }
        });
    }
}

/// Top-level split between tunnels, forward-proxy requests and the admin surface.
async fn route(state: &AppState, router: Router, request: Request<Body>) -> Response {
    if request.method() == Method::CONNECT {
        return state.interceptor.handle_connect(request);
    }
    if request.uri().scheme().is_some() {
        return state.dispatcher.handle_absolute(request).await;
    }
    match router.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}
