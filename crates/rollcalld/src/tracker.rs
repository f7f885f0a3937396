//! Per-session "already handled" set.
//!
//! Advisory only: it saves ledger round-trips for people who stay in view.
//! The ledger's uniqueness rule is what keeps one mark per day.

use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct SessionTracker {
    seen: HashSet<String>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the identity was not already in the set.
    pub fn mark_seen(&mut self, identity: &str) -> bool {
        self.seen.insert(identity.to_string())
    }

    pub fn already_seen(&self, identity: &str) -> bool {
        self.seen.contains(identity)
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
