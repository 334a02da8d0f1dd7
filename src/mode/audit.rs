//! Bounded audit log of mode changes.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mode::state::Mode;

/// Default number of retained entries.
pub const DEFAULT_AUDIT_CAPACITY: usize = 100;

/// One recorded mode change. `domain` is empty for global changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeChangeAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub previous_mode: Mode,
    pub new_mode: Mode,
    pub domain: String,
}

/// Fixed-capacity ring buffer; the oldest entry is evicted on overflow.
#[derive(Debug)]
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<ModeChangeAuditEntry>>,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<ModeChangeAuditEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, user: &str, previous_mode: Mode, new_mode: Mode, domain: &str) {
        let entry = ModeChangeAuditEntry {
            timestamp: Utc::now(),
            user: user.to_string(),
            previous_mode,
            new_mode,
            domain: domain.to_string(),
        };
        let mut entries = self.entries();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Snapshot copy in insertion order.
    pub fn list(&self) -> Vec<ModeChangeAuditEntry> {
        self.entries().iter().cloned().collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}
