//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (IDs, drain tracking)
//!     → Hand off to HTTP layer
//!
//! CONNECT request
//!     → tunnel.rs (200 Connection Established, upgrade)
//!     → tls.rs acceptor present? intercept : blind splice
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Connections and tunnels are tracked for graceful shutdown
//! - One pre-generated certificate; nothing is minted at runtime

pub mod connection;
pub mod listener;
pub mod tls;
pub mod tunnel;
