//! Crate-level errors for startup and serving.
//!
//! Request-path failures never surface here: they are mapped to responses
//! in `http::response`. These errors end the process.

use thiserror::Error;

use crate::config::ConfigError;
use crate::http::upstream::OriginRootError;
use crate::mode::InvalidMode;
use crate::net::listener::ListenerError;
use crate::net::tls::TlsError;

/// Failure to build or run the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid initial mode: {0}")]
    InvalidMode(#[from] InvalidMode),

    #[error("interception certificate: {0}")]
    Tls(#[from] TlsError),

    #[error("origin root certificate: {0}")]
    OriginRoot(#[from] OriginRootError),

    #[error("failed to build live client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Top-level error returned by the proxy binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to initialize logging: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),

    #[error("failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("invalid metrics address {0}")]
    MetricsAddress(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
