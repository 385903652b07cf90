//! The `ErrorClassifier`: maps a raised failure into the tagged `ErrorKind`
//! every downstream decision branches on, so no component has to re-derive
//! "is this fatal?" from a raw error type.

use std::collections::HashSet;
use std::time::Duration;

/// The four-ish outcomes an error can be classified into. `Fatal` is split
/// into its three distinct process-level responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource-exhaustion / unrecoverable-runtime-fault equivalent: the
    /// process exits immediately (exit code 2) after a stop attempt.
    FatalProcessImmediate,
    /// Linkage/load-time-fault equivalent: graceful stop then exit (code 3).
    FatalProcessGraceful,
    /// Database- or queue-configuration error that needs operator
    /// intervention. Stops the worker; the supervisor will not restart it
    /// automatically — see `Supervisor::restart_failed`.
    FatalWorker,
    /// Transient fault. Rollback, increment retry, back off, continue.
    Retryable,
    /// Per-message failure that has exceeded `maxRetries`, or a deterministic
    /// validation failure. Acknowledge with a reason; retry state clears.
    Poison,
    /// Cancellation / interruption signal. Orderly worker exit.
    Shutdown,
}

/// The raw failure a worker observed, already stripped of its underlying
/// driver-specific type so the classifier stays independent of which queue
/// backend produced it.
#[derive(Debug, Clone)]
pub enum Failure {
    /// A database/queue-driver failure, optionally carrying a vendor error
    /// code or SQLSTATE-family string used to match `fatal_db_codes`.
    Database { code: Option<String>, message: String },
    /// Malformed JSON, a missing/empty required field, or an unrecognized
    /// `operation` value. Always classified as `Poison`.
    Validation(String),
    /// An error raised by a handler's `onInsert`/`onUpdate`/`onDelete`.
    Handler(String),
    /// A programming-assertion failure surfaced from handler code.
    Assertion(String),
    /// The worker observed the shutdown/cancellation signal mid-operation.
    Shutdown,
}

/// Tunables for `ErrorClassifier`: retry/backoff timing, the seeded vendor
/// error-code list, and the assertion-handling policy.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub use_exponential_backoff: bool,
    /// Database/queue error codes that indicate an unrecoverable
    /// configuration problem (disabled broker, missing queue/service/
    /// contract/message-type objects, auth failures, permission denials,
    /// unavailable/recovering database, connection-refused/timeout).
    pub fatal_db_codes: HashSet<String>,
    /// Whether a programming-assertion failure is treated as `Retryable`
    /// (repeated failure eventually escalates to `Poison` via the
    /// retry-limit transition) or is instead logged-and-skipped on first
    /// occurrence; see `DESIGN.md`.
    pub assertion_is_retryable: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(60),
            use_exponential_backoff: true,
            fatal_db_codes: default_fatal_db_codes(),
            assertion_is_retryable: true,
        }
    }
}

/// Seed values for the Fatal-DB condition families: service-broker-disabled,
/// missing queue/service/contract/message-type objects, authentication
/// failures, permission denials, database-unavailable/recovering states, and
/// connection-refused/timeout classes. Modeled as SQLSTATE-style class codes
/// so any driver can map its native error into one of these families.
fn default_fatal_db_codes() -> HashSet<String> {
    [
        "08001", // connection refused / unable to connect
        "08004", // connection rejected
        "08006", // connection failure
        "28000", // invalid authorization / auth failure
        "28P01", // invalid password
        "42501", // insufficient privilege / permission denied
        "3D000", // invalid catalog name (missing database)
        "42P01", // undefined table (missing queue/service object)
        "57P03", // cannot connect now (database starting up / recovering)
        "57P01", // admin shutdown
        "HYT00", // timeout expired
        "BROKER_DISABLED",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Pure, lock-free mapper from `Failure` to `ErrorKind`. Holds no state of
/// its own; construct one per `Services` bundle and share it by reference.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    config: ClassifierConfig,
}

impl ErrorClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classifies a failure into the tagged `ErrorKind` every downstream
    /// decision branches on. Does not consider retry counts: the
    /// retry-limit transition (retryable-but-exhausted becomes `Poison`) is
    /// applied by the caller, which alone knows the conversation's
    /// `RetryState`.
    pub fn classify(&self, failure: &Failure) -> ErrorKind {
        match failure {
            Failure::Shutdown => ErrorKind::Shutdown,
            Failure::Validation(_) => ErrorKind::Poison,
            Failure::Handler(_) => ErrorKind::Retryable,
            Failure::Assertion(_) => {
                if self.config.assertion_is_retryable {
                    ErrorKind::Retryable
                } else {
                    ErrorKind::Poison
                }
            }
            Failure::Database { code, .. } => {
                if code
                    .as_deref()
                    .is_some_and(|c| self.config.fatal_db_codes.contains(c))
                {
                    ErrorKind::FatalWorker
                } else {
                    ErrorKind::Retryable
                }
            }
        }
    }

    /// Retry delay for `attempt` (1-based): `min(base * 2^min(n, 10), cap)`
    /// when exponential backoff is enabled, else a constant `base`. The
    /// caller is responsible for making the sleep cancellable by the
    /// shutdown signal.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if !self.config.use_exponential_backoff {
            return self.config.base_retry_delay;
        }
        let exponent = attempt.min(10);
        let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let candidate = self
            .config
            .base_retry_delay
            .checked_mul(multiplier as u32)
            .unwrap_or(self.config.max_retry_delay);
        candidate.min(self.config.max_retry_delay)
    }
}
