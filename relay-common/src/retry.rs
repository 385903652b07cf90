//! `RetryLedger`: a concurrency-safe conversation-handle → `RetryState` map.
//! Exactly one worker mutates a given handle's state at a time (the one
//! currently holding the conversation), but the ledger itself must tolerate
//! being hit from any worker's task concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::types::ConversationHandle;

/// Per-conversation retry bookkeeping. `count` is monotone non-decreasing
/// for the lifetime of the state; `first_failure_at` is set exactly once,
/// on the first recorded failure, and never reset.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryState {
    pub count: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_error_kind: Option<String>,
}

impl RetryState {
    fn fresh() -> Self {
        Self {
            count: 0,
            first_failure_at: None,
            last_error_kind: None,
        }
    }
}

struct Entry(Mutex<RetryState>);

/// At most one `RetryState` per handle; `size()` is read-only and used
/// only for telemetry.
#[derive(Default)]
pub struct RetryLedger {
    entries: Mutex<HashMap<ConversationHandle, Arc<Entry>>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, handle: &ConversationHandle) -> Arc<Entry> {
        let mut entries = self.entries.lock();
        entries
            .entry(handle.clone())
            .or_insert_with(|| Arc::new(Entry(Mutex::new(RetryState::fresh()))))
            .clone()
    }

    /// Atomic insert-if-absent; returns the current state for `handle`,
    /// creating a fresh one (count 0) if none exists yet.
    pub fn get_or_create(&self, handle: &ConversationHandle) -> RetryState {
        self.entry(handle).0.lock().clone()
    }

    /// Records a failure against `handle`: increments `count`, stamps
    /// `first_failure_at` if this is the first failure, and records
    /// `error_kind`. Returns the updated state.
    pub fn record_failure(&self, handle: &ConversationHandle, error_kind: &str) -> RetryState {
        let entry = self.entry(handle);
        let mut state = entry.0.lock();
        if state.first_failure_at.is_none() {
            state.first_failure_at = Some(Utc::now());
        }
        state.count += 1;
        state.last_error_kind = Some(error_kind.to_string());
        state.clone()
    }

    /// Removes the entry for `handle`. Idempotent: clearing an absent handle
    /// is a no-op.
    pub fn clear(&self, handle: &ConversationHandle) {
        self.entries.lock().remove(handle);
    }

    /// Empties the map; used at supervisor shutdown.
    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    /// Read-only count of tracked handles, for telemetry.
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_fresh_state_for_new_handle() {
        let ledger = RetryLedger::new();
        let handle = ConversationHandle::from("conv-1");

        let state = ledger.get_or_create(&handle);

        assert_eq!(state.count, 0);
        assert!(state.first_failure_at.is_none());
        assert_eq!(ledger.size(), 1);
    }

    #[test]
    fn record_failure_increments_count_and_stamps_first_failure_once() {
        let ledger = RetryLedger::new();
        let handle = ConversationHandle::from("conv-1");

        let first = ledger.record_failure(&handle, "Retryable");
        assert_eq!(first.count, 1);
        let stamp = first.first_failure_at.expect("stamped on first failure");

        let second = ledger.record_failure(&handle, "Retryable");
        assert_eq!(second.count, 2);
        assert_eq!(second.first_failure_at, Some(stamp));
        assert_eq!(second.last_error_kind.as_deref(), Some("Retryable"));
    }

    #[test]
    fn clear_removes_entry_and_is_idempotent() {
        let ledger = RetryLedger::new();
        let handle = ConversationHandle::from("conv-1");
        ledger.record_failure(&handle, "Retryable");
        assert_eq!(ledger.size(), 1);

        ledger.clear(&handle);
        assert_eq!(ledger.size(), 0);

        // idempotent
        ledger.clear(&handle);
        assert_eq!(ledger.size(), 0);
    }

    #[test]
    fn poison_clears_state_so_next_lookup_is_fresh() {
        let ledger = RetryLedger::new();
        let handle = ConversationHandle::from("conv-1");
        ledger.record_failure(&handle, "Retryable");
        ledger.record_failure(&handle, "Retryable");

        ledger.clear(&handle);

        let state = ledger.get_or_create(&handle);
        assert_eq!(state.count, 0);
        assert!(state.first_failure_at.is_none());
    }

    #[test]
    fn clear_all_empties_the_ledger() {
        let ledger = RetryLedger::new();
        ledger.record_failure(&ConversationHandle::from("a"), "Retryable");
        ledger.record_failure(&ConversationHandle::from("b"), "Retryable");
        assert_eq!(ledger.size(), 2);

        ledger.clear_all();
        assert_eq!(ledger.size(), 0);
    }

    #[test]
    fn distinct_handles_track_independent_state() {
        let ledger = RetryLedger::new();
        let a = ConversationHandle::from("a");
        let b = ConversationHandle::from("b");

        ledger.record_failure(&a, "Retryable");
        ledger.record_failure(&a, "Retryable");
        ledger.record_failure(&b, "Retryable");

        assert_eq!(ledger.get_or_create(&a).count, 2);
        assert_eq!(ledger.get_or_create(&b).count, 1);
    }
}
