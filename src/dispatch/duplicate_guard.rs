//! # Duplicate Guard
//!
//! Content-hash based suppression of repeat sends. A send is a duplicate when
//! an identical (template text, variables) hash was recorded for the same
//! phone number within the retention window. Numbers on the bypass allow-list
//! (employees) skip the check entirely; that is a policy decision and the
//! list is fully overridable.
//!
//! Concurrent identical sends are collapsed through an in-flight reservation:
//! `try_reserve` checks the records and claims the (phone, hash) pair under
//! one lock, so of two racing identical sends exactly one proceeds. The winner
//! converts its reservation into a record on success or releases it on
//! failure.
//!
//! Memory is bounded by opportunistic pruning: a small fraction of writes
//! triggers removal of entries older than the retention window.

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::constants::{DUPLICATE_PRUNE_PROBABILITY, DUPLICATE_RETENTION_DAYS};

#[derive(Debug, Clone, Copy)]
struct DuplicateEntry {
    content_hash: u64,
    recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct GuardState {
    records: HashMap<String, Vec<DuplicateEntry>>,
    in_flight: HashSet<(String, u64)>,
}

impl GuardState {
    fn has_record(&self, phone: &str, hash: u64, cutoff: DateTime<Utc>) -> bool {
        self.records.get(phone).is_some_and(|entries| {
            entries
                .iter()
                .any(|e| e.content_hash == hash && e.recorded_at > cutoff)
        })
    }
}

/// Phone-keyed duplicate suppression records.
pub struct DuplicateGuard {
    state: Mutex<GuardState>,
    bypass: RwLock<HashSet<String>>,
    retention: Duration,
}

impl DuplicateGuard {
    pub fn new(retention_days: i64) -> Self {
        Self {
            state: Mutex::new(GuardState::default()),
            bypass: RwLock::new(HashSet::new()),
            retention: Duration::days(retention_days),
        }
    }

    /// Deterministic hash of the rendered-source content.
    ///
    /// Variables are folded in sorted key order so logically identical JSON
    /// objects hash identically regardless of construction order.
    pub fn content_hash(text: &str, variables: &serde_json::Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);

        if let Some(map) = variables.as_object() {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(&mut hasher);
                map[key].to_string().hash(&mut hasher);
            }
        } else {
            variables.to_string().hash(&mut hasher);
        }

        hasher.finish()
    }

    /// Replace the bypass allow-list.
    pub fn set_bypass_list<I: IntoIterator<Item = String>>(&self, phones: I) {
        *self.bypass.write() = phones.into_iter().collect();
    }

    /// Add a single number to the bypass allow-list.
    pub fn add_bypass(&self, phone: &str) {
        self.bypass.write().insert(phone.to_string());
    }

    /// Check whether a number bypasses duplicate suppression.
    pub fn is_bypassed(&self, phone: &str) -> bool {
        self.bypass.read().contains(phone)
    }

    /// Check whether identical content was already sent to this number within
    /// the retention window. Bypassed numbers are never duplicates.
    pub fn is_duplicate(&self, phone: &str, text: &str, variables: &serde_json::Value) -> bool {
        if self.is_bypassed(phone) {
            return false;
        }

        let hash = Self::content_hash(text, variables);
        let cutoff = Utc::now() - self.retention;
        self.state.lock().has_record(phone, hash, cutoff)
    }

    /// Atomically check for a duplicate and claim the (phone, content) pair.
    ///
    /// Returns `false` when identical content was already recorded within the
    /// retention window or another send for the same pair is in flight. A
    /// successful reservation must be settled with [`record`](Self::record)
    /// or [`release`](Self::release). Bypassed numbers always pass and are
    /// not reserved.
    pub fn try_reserve(&self, phone: &str, text: &str, variables: &serde_json::Value) -> bool {
        if self.is_bypassed(phone) {
            return true;
        }

        let hash = Self::content_hash(text, variables);
        let cutoff = Utc::now() - self.retention;

        let mut state = self.state.lock();
        if state.has_record(phone, hash, cutoff) {
            return false;
        }
        state.in_flight.insert((phone.to_string(), hash))
    }

    /// Release a reservation without recording, after a failed send.
    pub fn release(&self, phone: &str, text: &str, variables: &serde_json::Value) {
        let hash = Self::content_hash(text, variables);
        self.state
            .lock()
            .in_flight
            .remove(&(phone.to_string(), hash));
    }

    /// Record a successful send for future duplicate checks, clearing any
    /// reservation for the pair.
    pub fn record(&self, phone: &str, text: &str, variables: &serde_json::Value) {
        let hash = Self::content_hash(text, variables);
        let entry = DuplicateEntry {
            content_hash: hash,
            recorded_at: Utc::now(),
        };

        let mut state = self.state.lock();
        state.in_flight.remove(&(phone.to_string(), hash));
        state
            .records
            .entry(phone.to_string())
            .or_default()
            .push(entry);
        drop(state);

        if fastrand::f32() < DUPLICATE_PRUNE_PROBABILITY {
            self.prune();
        }
    }

    /// Drop entries older than the retention window.
    pub fn prune(&self) {
        let cutoff = Utc::now() - self.retention;
        let mut state = self.state.lock();
        state.records.retain(|_, entries| {
            entries.retain(|e| e.recorded_at > cutoff);
            !entries.is_empty()
        });
    }

    /// Total retained entries, for tests and diagnostics.
    pub fn entry_count(&self) -> usize {
        self.state.lock().records.values().map(Vec::len).sum()
    }
}

impl Default for DuplicateGuard {
    fn default() -> Self {
        Self::new(DUPLICATE_RETENTION_DAYS)
    }
}
