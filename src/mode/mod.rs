//! Mode and override management.
//!
//! # Data Flow
//! ```text
//! Admin surface (string) → ModeSelection::from_str → ModeManager mutator → AuditLog
//! Dispatcher (domain)    → ModeManager::resolve → Resolved { mode, hybrid_fallback }
//! ```

pub mod audit;
pub mod state;

pub use audit::{AuditLog, ModeChangeAuditEntry};
pub use state::{InvalidMode, Mode, ModeManager, ModeSelection, ModeSnapshot, Resolved};
