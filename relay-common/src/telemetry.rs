//! Telemetry: per-worker counters, an aggregate view, and a bounded error
//! log, all readable without blocking worker progress.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::ErrorKind;

const RECENT_ACTIVITY_WINDOW_SECS: i64 = 5 * 60;
const ERROR_RING_CAPACITY: usize = 100;

/// Lock-free per-worker counter bundle. All counters are monotone
/// non-decreasing while the worker runs; reads never block the worker's
/// own progress.
pub struct WorkerTelemetry {
    started_at: DateTime<Utc>,
    last_message_at_millis: AtomicI64,
    messages_processed: AtomicU64,
    errors_encountered: AtomicU64,
    running: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl WorkerTelemetry {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            last_message_at_millis: AtomicI64::new(0),
            messages_processed: AtomicU64::new(0),
            errors_encountered: AtomicU64::new(0),
            running: AtomicBool::new(true),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn record_message(&self) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.last_message_at_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors_encountered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Relaxed);
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let last_message_millis = self.last_message_at_millis.load(Ordering::Relaxed);
        let last_message_at = if last_message_millis == 0 {
            None
        } else {
            DateTime::from_timestamp_millis(last_message_millis)
        };

        WorkerSnapshot {
            started_at: self.started_at,
            last_message_at,
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            errors_encountered: self.errors_encountered.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            shutdown_requested: self.shutdown_requested.load(Ordering::Relaxed),
        }
    }
}

impl Default for WorkerTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time read of `WorkerTelemetry`, with its derived fields
/// (uptime, throughput, error rate, recent-activity flag).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkerSnapshot {
    pub started_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub messages_processed: u64,
    pub errors_encountered: u64,
    pub running: bool,
    pub shutdown_requested: bool,
}

impl WorkerSnapshot {
    pub fn uptime_seconds(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn messages_per_second(&self) -> f64 {
        let uptime = self.uptime_seconds();
        if uptime <= 0.0 {
            0.0
        } else {
            self.messages_processed as f64 / uptime
        }
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.messages_processed + self.errors_encountered;
        if total == 0 {
            0.0
        } else {
            self.errors_encountered as f64 / total as f64
        }
    }

    /// True if a message was processed within the last 5 minutes.
    pub fn has_recent_activity(&self) -> bool {
        match self.last_message_at {
            Some(at) => (Utc::now() - at).num_seconds() <= RECENT_ACTIVITY_WINDOW_SECS,
            None => false,
        }
    }
}

/// Combined view over all live workers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AggregateSnapshot {
    pub active_count: usize,
    pub configured_count: usize,
    pub total_messages_processed: u64,
    pub total_errors_encountered: u64,
    pub average_messages_per_second: f64,
    pub average_error_rate: f64,
    pub fully_operational: bool,
}

/// Computes the aggregate view. `supervising` and `error_rate_threshold`
/// come from the supervisor; `fully_operational` requires the supervisor to
/// be actively supervising, every configured worker to be active, and the
/// average error rate to stay under the threshold.
pub fn summarize(
    snapshots: &[WorkerSnapshot],
    configured_count: usize,
    supervising: bool,
    error_rate_threshold: f64,
) -> AggregateSnapshot {
    let active_count = snapshots.len();
    let total_messages_processed: u64 = snapshots.iter().map(|s| s.messages_processed).sum();
    let total_errors_encountered: u64 = snapshots.iter().map(|s| s.errors_encountered).sum();

    let average_messages_per_second = if active_count == 0 {
        0.0
    } else {
        snapshots.iter().map(|s| s.messages_per_second()).sum::<f64>() / active_count as f64
    };

    let average_error_rate = if active_count == 0 {
        0.0
    } else {
        snapshots.iter().map(|s| s.error_rate()).sum::<f64>() / active_count as f64
    };

    let fully_operational = supervising
        && active_count == configured_count
        && average_error_rate < error_rate_threshold;

    AggregateSnapshot {
        active_count,
        configured_count,
        total_messages_processed,
        total_errors_encountered,
        average_messages_per_second,
        average_error_rate,
        fully_operational,
    }
}

/// A single appended-to-the-ring error observation.
#[derive(Clone, Debug)]
pub struct ErrorLogEntry {
    pub at: DateTime<Utc>,
    pub kind: ErrorKind,
    pub worker_id: Option<u64>,
    pub conversation_handle: Option<String>,
    pub message: String,
}

/// Bounded in-memory ring (capacity 100) of classified errors, readable via
/// the telemetry interface.
pub struct ErrorRing {
    entries: Mutex<VecDeque<ErrorLogEntry>>,
}

impl ErrorRing {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(ERROR_RING_CAPACITY)),
        }
    }

    pub fn push(&self, entry: ErrorLogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == ERROR_RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<ErrorLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ErrorRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_telemetry_has_no_activity() {
        let telemetry = WorkerTelemetry::new();
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.messages_processed, 0);
        assert!(!snapshot.has_recent_activity());
        assert_eq!(snapshot.error_rate(), 0.0);
    }

    #[test]
    fn recording_a_message_marks_recent_activity() {
        let telemetry = WorkerTelemetry::new();
        telemetry.record_message();
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.messages_processed, 1);
        assert!(snapshot.has_recent_activity());
    }

    #[test]
    fn error_rate_divides_errors_by_total() {
        let telemetry = WorkerTelemetry::new();
        telemetry.record_message();
        telemetry.record_message();
        telemetry.record_error();
        let snapshot = telemetry.snapshot();
        assert!((snapshot.error_rate() - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let ring = ErrorRing::new();
        for i in 0..150 {
            ring.push(ErrorLogEntry {
                at: Utc::now(),
                kind: ErrorKind::Retryable,
                worker_id: Some(1),
                conversation_handle: None,
                message: format!("error {i}"),
            });
        }
        assert_eq!(ring.len(), 100);
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.first().unwrap().message, "error 50");
        assert_eq!(snapshot.last().unwrap().message, "error 149");
    }

    #[test]
    fn aggregate_is_fully_operational_only_when_counts_match_and_error_rate_low() {
        let healthy = WorkerSnapshot {
            started_at: Utc::now(),
            last_message_at: Some(Utc::now()),
            messages_processed: 100,
            errors_encountered: 0,
            running: true,
            shutdown_requested: false,
        };

        let summary = summarize(&[healthy, healthy], 2, true, 0.1);
        assert!(summary.fully_operational);

        let summary_understaffed = summarize(&[healthy], 2, true, 0.1);
        assert!(!summary_understaffed.fully_operational);

        let summary_not_supervising = summarize(&[healthy, healthy], 2, false, 0.1);
        assert!(!summary_not_supervising.fully_operational);
    }
}
