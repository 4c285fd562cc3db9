//! Shared up/down status tables.
//!
//! Both the request path and the health-probe path read and write these
//! tables concurrently. Every update goes through a single `DashMap` entry so
//! writers only contend on the shard holding their key.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Status of one element or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEntry {
    /// Whether the destination is currently considered reachable.
    pub up: bool,
    /// When `up` last flipped (or the entry was created).
    pub changed_at: Instant,
    /// When the destination was last probed.
    pub checked_at: Option<Instant>,
}

impl StatusEntry {
    fn new(now: Instant) -> Self {
        Self {
            up: true,
            changed_at: now,
            checked_at: None,
        }
    }
}

/// Concurrent map of status entries. Unknown keys read as up.
#[derive(Debug, Default)]
pub struct StatusTable {
    entries: DashMap<String, StatusEntry>,
}

impl StatusTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the key is up; keys never seen are up.
    pub fn is_up(&self, key: &str) -> bool {
        self.entries.get(key).map(|e| e.up).unwrap_or(true)
    }

    /// Copy of the entry, if one exists.
    pub fn get(&self, key: &str) -> Option<StatusEntry> {
        self.entries.get(key).map(|e| *e)
    }

    /// Set the status, returning `true` only when the value actually changed.
    ///
    /// Re-observing the current status is a no-op, which is what keeps
    /// up/down events from being emitted twice.
    pub fn set(&self, key: &str, up: bool) -> bool {
        self.set_at(key, up, Instant::now())
    }

    /// [`StatusTable::set`] with an explicit clock.
    pub fn set_at(&self, key: &str, up: bool, now: Instant) -> bool {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StatusEntry::new(now));
        entry.checked_at = Some(now);
        if entry.up == up {
            return false;
        }
        entry.up = up;
        entry.changed_at = now;
        true
    }

    /// Whether a probe is due: never checked, or checked longer than
    /// `interval` ago.
    pub fn is_check_due(&self, key: &str, interval: Duration, now: Instant) -> bool {
        match self.entries.get(key).and_then(|e| e.checked_at) {
            Some(checked) => now.saturating_duration_since(checked) >= interval,
            None => true,
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key has been tracked yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Element and server-group status tables shared by routing and probing.
#[derive(Debug, Default)]
pub struct HealthState {
    /// Keyed by element key (`host|port|transport`).
    pub elements: StatusTable,
    /// Keyed by server group name.
    pub groups: StatusTable,
}

impl HealthState {
    /// Create empty tables.
    pub fn new() -> Self {
        Self::default()
    }
}

/// A thread-safe reference to the status tables.
pub type SharedHealthState = Arc<HealthState>;
