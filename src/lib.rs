//! Replay proxy library.
//!
//! An HTTP/HTTPS intercepting proxy that serves each request from version-
//! controlled fixtures or a recorded cache, fetches it live and records it,
//! or passes it straight through, depending on the mode of its domain.

pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod mode;
pub mod net;
pub mod observability;

pub use config::schema::ProxyConfig;
pub use error::{Error, ServerError};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
