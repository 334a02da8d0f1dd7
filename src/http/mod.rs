//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper connection, request ID + trace layers)
//!     → CONNECT?      → net::tunnel (intercept, then back into dispatch.rs)
//!     → absolute URI? → dispatch.rs
//!     → otherwise     → admin router, fallback dispatch.rs
//! dispatch.rs
//!     → cache lookup / upstream.rs (live fetch)
//!     → response.rs (marker headers, failure bodies)
//!     → Send to client
//! ```

pub mod dispatch;
pub mod request;
pub mod response;
pub mod server;
pub mod upstream;

pub use dispatch::Dispatcher;
pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::{AppState, HttpServer};
