//! Operating mode and per-domain overrides.
//!
//! # States
//! - Replay: serve from cache only; a miss is an error unless hybrid fallback is on
//! - Record: serve from cache, fetch and store on a miss
//! - Live: always fetch, never read or write the cache
//!
//! # Design Decisions
//! - Global mode, hybrid flag and overrides live behind one lock so a request
//!   resolves all of them from the same state
//! - Requests keep the mode they resolved even if it changes mid-flight
//! - Override domains are normalized on the way in

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::key::normalize_domain;
use crate::mode::audit::AuditLog;

/// Stored operating mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Replay,
    Record,
    Live,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Replay => "replay",
            Mode::Record => "record",
            Mode::Live => "live",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized mode string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid mode {0:?}: expected one of replay, record, live, hybrid")]
pub struct InvalidMode(pub String);

impl FromStr for Mode {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replay" => Ok(Mode::Replay),
            "record" => Ok(Mode::Record),
            "live" => Ok(Mode::Live),
            _ => Err(InvalidMode(s.to_string())),
        }
    }
}

/// A mode as requested from outside: a stored mode, or `hybrid`
/// (replay with the fallback flag switched on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSelection {
    Plain(Mode),
    Hybrid,
}

impl ModeSelection {
    pub fn mode(&self) -> Mode {
        match self {
            ModeSelection::Plain(mode) => *mode,
            ModeSelection::Hybrid => Mode::Replay,
        }
    }
}

impl FromStr for ModeSelection {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("hybrid") {
            return Ok(ModeSelection::Hybrid);
        }
        s.parse().map(ModeSelection::Plain)
    }
}

impl fmt::Display for ModeSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeSelection::Plain(mode) => mode.fmt(f),
            ModeSelection::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// Mode state captured for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub mode: Mode,
    pub hybrid_fallback: bool,
    /// The mode came from a per-domain override.
    pub overridden: bool,
}

/// Consistent copy of the whole mode state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeSnapshot {
    pub mode: Mode,
    pub hybrid_fallback: bool,
    pub domain_overrides: BTreeMap<String, Mode>,
}

#[derive(Debug)]
struct ProxyState {
    global: Mode,
    hybrid_fallback: bool,
    overrides: BTreeMap<String, Mode>,
}

/// Owner of global mode, hybrid flag, domain overrides and the audit log.
#[derive(Debug)]
pub struct ModeManager {
    state: RwLock<ProxyState>,
    audit: AuditLog,
}

impl ModeManager {
    pub fn new(initial: Mode, hybrid_fallback: bool, audit_capacity: usize) -> Self {
        Self {
            state: RwLock::new(ProxyState {
                global: initial,
                hybrid_fallback,
                overrides: BTreeMap::new(),
            }),
            audit: AuditLog::new(audit_capacity),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ProxyState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProxyState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Mode and hybrid flag governing a request for `domain`.
    pub fn resolve(&self, domain: &str) -> Resolved {
        let domain = normalize_domain(domain);
        let state = self.read();
        match state.overrides.get(&domain) {
            Some(mode) => Resolved {
                mode: *mode,
                hybrid_fallback: state.hybrid_fallback,
                overridden: true,
            },
            None => Resolved {
                mode: state.global,
                hybrid_fallback: state.hybrid_fallback,
                overridden: false,
            },
        }
    }

    pub fn effective_mode(&self, domain: &str) -> Mode {
        self.resolve(domain).mode
    }

    pub fn global_mode(&self) -> Mode {
        self.read().global
    }

    pub fn hybrid_fallback(&self) -> bool {
        self.read().hybrid_fallback
    }

    pub fn snapshot(&self) -> ModeSnapshot {
        let state = self.read();
        ModeSnapshot {
            mode: state.global,
            hybrid_fallback: state.hybrid_fallback,
            domain_overrides: state.overrides.clone(),
        }
    }

    /// Set the global mode. Returns the previous one.
    pub fn set_global_mode(&self, mode: Mode, user: &str) -> Mode {
        let mut state = self.write();
        let previous = state.global;
        state.global = mode;
        self.audit.record(user, previous, mode, "");
        drop(state);

        counter!("replay_proxy_mode_changes_total", "scope" => "global").increment(1);
        tracing::info!(user = %user, previous = %previous, mode = %mode, "Global mode changed");
        previous
    }

    /// Apply an externally requested mode; `hybrid` also enables the fallback
    /// flag in the same update.
    pub fn apply_selection(&self, selection: ModeSelection, user: &str) -> Mode {
        let mode = selection.mode();
        let mut state = self.write();
        let previous = state.global;
        state.global = mode;
        if selection == ModeSelection::Hybrid {
            state.hybrid_fallback = true;
        }
        self.audit.record(user, previous, mode, "");
        drop(state);

        counter!("replay_proxy_mode_changes_total", "scope" => "global").increment(1);
        tracing::info!(user = %user, previous = %previous, selection = %selection, "Global mode changed");
        previous
    }

    /// Override the mode for one domain. Returns the previously effective mode.
    pub fn set_domain_mode(&self, domain: &str, mode: Mode, user: &str) -> Mode {
        let domain = normalize_domain(domain);
        let mut state = self.write();
        let previous = state.overrides.get(&domain).copied().unwrap_or(state.global);
        state.overrides.insert(domain.clone(), mode);
        self.audit.record(user, previous, mode, &domain);
        drop(state);

        counter!("replay_proxy_mode_changes_total", "scope" => "domain").increment(1);
        tracing::info!(user = %user, domain = %domain, previous = %previous, mode = %mode, "Domain mode override set");
        previous
    }

    /// Remove a domain override. Returns the removed mode, if any.
    ///
    /// Only an existing override produces an audit entry, recorded as a
    /// change back to the global mode.
    pub fn clear_domain_mode(&self, domain: &str, user: &str) -> Option<Mode> {
        let domain = normalize_domain(domain);
        let mut state = self.write();
        let removed = state.overrides.remove(&domain)?;
        let global = state.global;
        self.audit.record(user, removed, global, &domain);
        drop(state);

        counter!("replay_proxy_mode_changes_total", "scope" => "domain").increment(1);
        tracing::info!(user = %user, domain = %domain, previous = %removed, mode = %global, "Domain mode override cleared");
        Some(removed)
    }

    /// Toggle hybrid fallback. Not a mode change, so it is not audited.
    pub fn set_hybrid_fallback(&self, enabled: bool, user: &str) -> bool {
        let previous = std::mem::replace(&mut self.write().hybrid_fallback, enabled);
        tracing::info!(user = %user, enabled, previous, "Hybrid fallback updated");
        previous
    }
}

impl Default for ModeManager {
    fn default() -> Self {
        Self::new(Mode::default(), false, crate::mode::audit::DEFAULT_AUDIT_CAPACITY)
    }
}
