//! `ListenerWorker`: one worker's full lifecycle — acquire a connection,
//! loop {dequeue → dispatch → acknowledge|rollback → retry/poison}, drain on
//! shutdown, report an outcome. A worker owns its connection for its entire
//! lifetime; nothing else touches it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relay_common::error::{ErrorClassifier, ErrorKind, Failure};
use relay_common::registry::HandlerRegistry;
use relay_common::retry::RetryLedger;
use relay_common::telemetry::{ErrorLogEntry, ErrorRing, WorkerTelemetry};
use relay_queue::backend::QueueBackend;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::dispatcher::{Dispatcher, DispatchOutcome};

/// Shared, immutable-after-construction collaborators every worker needs.
pub struct Services<B: QueueBackend> {
    pub backend: Arc<B>,
    pub classifier: Arc<ErrorClassifier>,
    pub registry: Arc<HandlerRegistry>,
    pub ledger: Arc<RetryLedger>,
    pub error_ring: Arc<ErrorRing>,
    pub config: WorkerRuntimeConfig,
}

#[derive(Debug, Clone)]
pub struct WorkerRuntimeConfig {
    pub queue_name: String,
    pub max_retries: u32,
}

/// Terminal state a worker reports to its supervisor. Only `FatalWorker` is
/// eligible for restart, and only through the supervisor's manual
/// `restart_failed` — nothing here restarts a worker automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Graceful,
    FatalWorker,
    FatalProcessImmediate,
    FatalProcessGraceful,
}

impl WorkerOutcome {
    fn from_error_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::FatalProcessImmediate => WorkerOutcome::FatalProcessImmediate,
            ErrorKind::FatalProcessGraceful => WorkerOutcome::FatalProcessGraceful,
            ErrorKind::Shutdown => WorkerOutcome::Graceful,
            // FatalWorker, Retryable, Poison never reach here as a loop-ending kind.
            _ => WorkerOutcome::FatalWorker,
        }
    }
}

pub struct ListenerWorker<B: QueueBackend> {
    worker_id: u64,
    services: Arc<Services<B>>,
    telemetry: Arc<WorkerTelemetry>,
    cancel: CancellationToken,
    /// Consecutive retryable receive-level failures observed with no
    /// conversation handle to key off. Drives backoff on that path the same
    /// way `RetryLedger` drives it for per-message failures; reset once a
    /// message is successfully received.
    receive_retry_streak: AtomicU32,
}

impl<B: QueueBackend> ListenerWorker<B> {
    pub fn new(
        worker_id: u64,
        services: Arc<Services<B>>,
        telemetry: Arc<WorkerTelemetry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            services,
            telemetry,
            cancel,
            receive_retry_streak: AtomicU32::new(0),
        }
    }

    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// Runs Ignition → Running → Draining → Terminated to completion.
    pub async fn run(self) -> WorkerOutcome {
        self.telemetry.set_running(true);

        let mut conn = match self.services.backend.acquire().await {
            Ok(conn) => conn,
            Err(error) => {
                self.telemetry.record_error();
                self.record_error(
                    None,
                    ErrorKind::FatalWorker,
                    format!("ignition failed: {error}"),
                );
                self.telemetry.set_running(false);
                return WorkerOutcome::FatalWorker;
            }
        };

        let outcome = self.run_loop(&mut conn).await;

        self.telemetry.set_running(false);
        self.services.backend.safe_close_with_rollback(conn).await;
        outcome
    }

    async fn run_loop(&self, conn: &mut B::Connection) -> WorkerOutcome {
        loop {
            if self.cancel.is_cancelled() {
                return WorkerOutcome::Graceful;
            }

            let received = self
                .services
                .backend
                .receive(
                    conn,
                    &self.services.config.queue_name,
                    self.worker_id,
                    &self.cancel,
                )
                .await;

            let raw = match received {
                Ok(Some(raw)) => {
                    self.receive_retry_streak.store(0, Ordering::SeqCst);
                    raw
                }
                Ok(None) => continue,
                Err(error) => match self.handle_failure(conn, None, error.into_failure()).await {
                    Some(outcome) => return outcome,
                    None => continue,
                },
            };

            let handle = raw.conversation_handle.clone();

            match Dispatcher::dispatch(&raw, &self.services.registry).await {
                DispatchOutcome::Acknowledge(reason) => {
                    if let Err(error) = self
                        .services
                        .backend
                        .end_conversation(conn, &handle, &reason)
                        .await
                    {
                        if let Some(outcome) =
                            self.handle_failure(conn, Some(&handle), error.into_failure()).await
                        {
                            return outcome;
                        }
                        continue;
                    }
                    if let Err(error) = self.services.backend.commit(conn).await {
                        if let Some(outcome) =
                            self.handle_failure(conn, Some(&handle), error.into_failure()).await
                        {
                            return outcome;
                        }
                        continue;
                    }
                    self.services.ledger.clear(&handle);
                    self.telemetry.record_message();
                }
                DispatchOutcome::Failure(failure) => {
                    if let Some(outcome) =
                        self.handle_failure(conn, Some(&handle), failure).await
                    {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Consults the classifier (and, for retryable failures, the
    /// retry-limit transition) and carries out the corresponding rollback,
    /// poison-acknowledge, backoff, or loop-ending action. Returns `Some`
    /// when the running loop must end, `None` when it should continue.
    async fn handle_failure(
        &self,
        conn: &mut B::Connection,
        handle: Option<&relay_common::types::ConversationHandle>,
        failure: Failure,
    ) -> Option<WorkerOutcome> {
        self.telemetry.record_error();
        let mut kind = self.services.classifier.classify(&failure);

        if kind == ErrorKind::Retryable {
            if let Some(handle) = handle {
                let state = self.services.ledger.get_or_create(handle);
                if state.count >= self.services.config.max_retries {
                    kind = ErrorKind::Poison;
                }
            }
        }

        self.record_error(
            handle.map(|h| h.as_str().to_string()),
            kind,
            error_message(&failure, kind),
        );

        match kind {
            ErrorKind::Retryable => {
                self.services.backend.safe_rollback(conn).await;
                if let Some(handle) = handle {
                    let state = self.services.ledger.record_failure(handle, "Retryable");
                    let delay = self.services.classifier.retry_delay(state.count);
                    self.sleep_cancellable(delay).await;
                } else {
                    // No conversation handle to key a retry count off of —
                    // this is a receive-level failure, before any message
                    // was dequeued — so track a per-worker streak instead;
                    // otherwise a persistent transient DB error would spin
                    // the loop with no delay at all.
                    let attempt = self.receive_retry_streak.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = self.services.classifier.retry_delay(attempt);
                    self.sleep_cancellable(delay).await;
                }
                None
            }
            ErrorKind::Poison => {
                let reason = poison_reason(&failure);
                if let Some(handle) = handle {
                    if let Err(error) = self
                        .services
                        .backend
                        .end_conversation(conn, handle, &reason)
                        .await
                    {
                        warn!(%error, "failed to acknowledge poisoned message; rolling back");
                        self.services.backend.safe_rollback(conn).await;
                    } else if let Err(error) = self.services.backend.commit(conn).await {
                        warn!(%error, "failed to commit poison acknowledgment; rolling back");
                        self.services.backend.safe_rollback(conn).await;
                    }
                    self.services.ledger.clear(handle);
                } else {
                    self.services.backend.safe_rollback(conn).await;
                }
                None
            }
            ErrorKind::FatalWorker => {
                self.services.backend.safe_rollback(conn).await;
                Some(WorkerOutcome::FatalWorker)
            }
            ErrorKind::Shutdown => {
                self.services.backend.safe_rollback(conn).await;
                Some(WorkerOutcome::Graceful)
            }
            ErrorKind::FatalProcessImmediate | ErrorKind::FatalProcessGraceful => {
                self.services.backend.safe_rollback(conn).await;
                Some(WorkerOutcome::from_error_kind(kind))
            }
        }
    }

    async fn sleep_cancellable(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn record_error(&self, conversation_handle: Option<String>, kind: ErrorKind, message: String) {
        self.services.error_ring.push(ErrorLogEntry {
            at: Utc::now(),
            kind,
            worker_id: Some(self.worker_id),
            conversation_handle,
            message,
        });
    }
}

fn poison_reason(failure: &Failure) -> String {
    match failure {
        Failure::Validation(message) => format!("poisoned: {message}"),
        Failure::Handler(message) => format!("poisoned after retry exhaustion: {message}"),
        Failure::Assertion(message) => format!("poisoned: assertion failure: {message}"),
        Failure::Database { message, .. } => format!("poisoned after retry exhaustion: {message}"),
        Failure::Shutdown => "poisoned during shutdown".to_string(),
    }
}

fn error_message(failure: &Failure, kind: ErrorKind) -> String {
    match failure {
        Failure::Validation(message) => format!("[{kind:?}] validation: {message}"),
        Failure::Handler(message) => format!("[{kind:?}] handler: {message}"),
        Failure::Assertion(message) => format!("[{kind:?}] assertion: {message}"),
        Failure::Database { code, message } => {
            format!("[{kind:?}] database ({code:?}): {message}")
        }
        Failure::Shutdown => format!("[{kind:?}] shutdown"),
    }
}
