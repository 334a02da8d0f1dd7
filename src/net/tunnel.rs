//! CONNECT tunnel interception.
//!
//! # States
//! ```text
//! AwaitingConnect → Established → Handshaking → Dispatching → Closed
//!                        └──────── (no certificate) → Blind → Closed
//! ```
//!
//! # Design Decisions
//! - `200 Connection Established` is answered before any TLS work begins
//! - Decrypted requests go through the same dispatcher as plain HTTP,
//!   addressed to the tunnel's target; a replay hit never dials the origin
//! - Without a certificate the tunnel is spliced byte-for-byte to the target
//! - Tunnels count as connections for shutdown draining

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tower_http::trace::TraceLayer;

use crate::http::dispatch::{Dispatcher, TunnelTarget};
use crate::http::request::{request_id_layers, RequestSpan};
use crate::http::response::ProxyFailure;
use crate::net::connection::{ConnectionId, ConnectionTracker};

/// Per-tunnel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    AwaitingConnect,
    Established,
    Handshaking,
    Dispatching,
    Blind,
    Closed,
}

/// One tunnel's state machine, logged on every transition.
#[derive(Debug)]
struct Tunnel {
    id: ConnectionId,
    target: TunnelTarget,
    state: TunnelState,
}

impl Tunnel {
    fn new(id: ConnectionId, target: TunnelTarget) -> Self {
        Self {
            id,
            target,
            state: TunnelState::AwaitingConnect,
        }
    }

    fn transition(&mut self, next: TunnelState) {
        tracing::debug!(
            connection_id = %self.id,
            target = %self.target,
            from = ?self.state,
            to = ?next,
            "Tunnel state change"
        );
        self.state = next;
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if self.state != TunnelState::Closed {
            self.transition(TunnelState::Closed);
        }
    }
}

/// Handles `CONNECT` requests.
pub struct Interceptor {
    acceptor: Option<TlsAcceptor>,
    dispatcher: Arc<Dispatcher>,
    tracker: ConnectionTracker,
}

impl Interceptor {
    pub fn new(
        acceptor: Option<TlsAcceptor>,
        dispatcher: Arc<Dispatcher>,
        tracker: ConnectionTracker,
    ) -> Self {
        if acceptor.is_none() {
            tracing::warn!("No interception certificate configured, CONNECT tunnels will be blind");
        }
        Self {
            acceptor,
            dispatcher,
            tracker,
        }
    }

    pub fn intercepts(&self) -> bool {
        self.acceptor.is_some()
    }

    /// Answer a CONNECT and take over the upgraded connection in the background.
    pub fn handle_connect(self: &Arc<Self>, request: Request<Body>) -> Response {
        let Some(target) = request
            .uri()
            .authority()
            .and_then(|authority| TunnelTarget::parse(authority.as_str()))
        else {
            return ProxyFailure::BadRequest("CONNECT requires host:port".into()).into_response();
        };

        let this = Arc::clone(self);
        let on_upgrade = hyper::upgrade::on(request);
        tokio::spawn(async move {
            let guard = this.tracker.track();
            let mut tunnel = Tunnel::new(guard.id(), target);
            match on_upgrade.await {
                Ok(upgraded) => {
                    tunnel.transition(TunnelState::Established);
                    this.run(&mut tunnel, upgraded).await;
                }
                Err(e) => {
                    tracing::warn!(target = %tunnel.target, error = %e, "CONNECT upgrade failed");
                }
            }
        });

        let mut response = StatusCode::OK.into_response();
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(b"Connection Established"));
        response
    }

    async fn run(&self, tunnel: &mut Tunnel, upgraded: Upgraded) {
        let io = TokioIo::new(upgraded);
        match &self.acceptor {
            Some(acceptor) => self.intercept(tunnel, acceptor, io).await,
            None => blind(tunnel, io).await,
        }
        tunnel.transition(TunnelState::Closed);
    }

    async fn intercept(&self, tunnel: &mut Tunnel, acceptor: &TlsAcceptor, io: TokioIo<Upgraded>) {
        tunnel.transition(TunnelState::Handshaking);
        let tls = match acceptor.accept(io).await {
            Ok(tls) => tls,
            Err(e) => {
                tracing::debug!(connection_id = %tunnel.id, target = %tunnel.target, error = %e, "TLS handshake failed");
                return;
            }
        };
        tunnel.transition(TunnelState::Dispatching);

        let dispatcher = Arc::clone(&self.dispatcher);
        let target = tunnel.target.clone();
        let service = request_id_layers()
            .layer(TraceLayer::new_for_http().make_span_with(RequestSpan))
            .service_fn(move |request: Request<Incoming>| {
                let dispatcher = Arc::clone(&dispatcher);
                let target = target.clone();
                async move {
                    let response = dispatcher
                        .handle_tunneled(&target, request.map(Body::new))
                        .await;
                    Ok::<_, Infallible>(response)
                }
            });

        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(tls), TowerToHyperService::new(service))
            .await
        {
            tracing::debug!(connection_id = %tunnel.id, error = %e, "Tunneled connection ended with error");
        }
    }
}

async fn blind(tunnel: &mut Tunnel, mut io: TokioIo<Upgraded>) {
    tunnel.transition(TunnelState::Blind);
    let address = tunnel.target.to_string();
    let mut upstream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(target = %address, error = %e, "Blind tunnel could not reach target");
            return;
        }
    };
    match tokio::io::copy_bidirectional(&mut io, &mut upstream).await {
        Ok((sent, received)) => {
            tracing::debug!(target = %address, sent, received, "Blind tunnel finished");
        }
        Err(e) => {
            tracing::debug!(target = %address, error = %e, "Blind tunnel ended with error");
        }
    }
}
