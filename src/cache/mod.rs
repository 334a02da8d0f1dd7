//! Deterministic response cache subsystem.
//!
//! # Data Flow
//! ```text
//! Request (method, url, headers)
//!     → key.rs (normalize URL + header fingerprint → METHOD_hash12)
//!     → store.rs (fixtures tier → recorded tier → miss)
//!     → coalesce.rs (one live fetch per key on a miss that may record)
//!     → entry.rs (capture live exchange, write metadata + body)
//! ```
//!
//! # Design Decisions
//! - Fixtures are read-only and always win over recorded entries
//! - Entries are two files per key so bodies can be hand-edited
//! - Lookups never touch the network

pub mod coalesce;
pub mod entry;
pub mod key;
pub mod store;

pub use coalesce::Coalescer;
pub use entry::{CacheEntry, Tier};
pub use key::{generate_key, normalize_domain};
pub use store::{CacheError, CacheStats, CacheStore, EntrySummary, Lookup};
