//! The supervisor: owns a fixed worker pool, reacts to worker deaths, and
//! applies the restart policy. The "worker-death callback" of a thread-pool
//! substrate has no literal equivalent in async Rust; it is modeled here as
//! a dedicated reaper task that drains an mpsc channel every worker's task
//! forwards its outcome into on exit, so a dying worker never calls back
//! into supervisor logic synchronously.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use relay_common::error::ErrorClassifier;
use relay_common::registry::HandlerRegistry;
use relay_common::retry::RetryLedger;
use relay_common::telemetry::{summarize, AggregateSnapshot, ErrorRing, WorkerSnapshot, WorkerTelemetry};
use relay_queue::backend::QueueBackend;
use relay_worker::{ListenerWorker, Services, WorkerOutcome, WorkerRuntimeConfig};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub listener_threads: usize,
    pub max_retries: u32,
    pub graceful_timeout: Duration,
    pub restart_settle_pause: Duration,
    pub error_rate_threshold: f64,
    pub max_queue_name_length: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            listener_threads: 4,
            max_retries: 5,
            graceful_timeout: Duration::from_secs(30),
            restart_settle_pause: Duration::from_millis(250),
            error_rate_threshold: 0.5,
            max_queue_name_length: 128,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("queue name must not be empty")]
    EmptyQueueName,
    #[error("queue name exceeds the configured maximum length of {max}")]
    QueueNameTooLong { max: usize },
    #[error("service broker is not enabled")]
    BrokerDisabled,
    #[error("queue {0:?} is not enabled")]
    QueueDisabled(String),
    #[error("preflight check failed: {0}")]
    Preflight(String),
    #[error("no preserved supervisor state to restart from; call start() first")]
    NoPreservedState,
}

/// A supervisor-owned read-only view of one live worker.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    pub worker_id: u64,
    pub started_at: DateTime<Utc>,
    pub telemetry: WorkerSnapshot,
}

struct ActiveWorker {
    worker_id: u64,
    started_at: DateTime<Utc>,
    telemetry: Arc<WorkerTelemetry>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns a fixed pool of `ListenerWorker`s. Every public operation takes
/// `self: &Arc<Self>` because the reaper task and replacement workers both
/// need to hold a clone of the supervisor across an arbitrary execution
/// context, the async equivalent of passing it by reference with no global
/// singleton.
pub struct Supervisor<B: QueueBackend> {
    backend: Arc<B>,
    classifier: Arc<ErrorClassifier>,
    ledger: Arc<RetryLedger>,
    error_ring: Arc<ErrorRing>,
    config: SupervisorConfig,
    next_worker_id: AtomicU64,
    supervising: AtomicBool,
    active: Mutex<HashMap<u64, ActiveWorker>>,
    /// Workers whose terminal outcome was Fatal-Worker: stopped, not
    /// auto-restarted, awaiting `restart_failed` as a manual safety hatch.
    dead: Mutex<HashMap<u64, WorkerOutcome>>,
    slots: RwLock<Option<Arc<Services<B>>>>,
    death_tx: mpsc::UnboundedSender<(u64, WorkerOutcome)>,
    death_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, WorkerOutcome)>>>,
    reaper_started: AtomicBool,
    fatal_outcome: Mutex<Option<WorkerOutcome>>,
    fatal_signal: Notify,
}

impl<B: QueueBackend> Supervisor<B> {
    pub fn new(backend: Arc<B>, classifier: Arc<ErrorClassifier>, config: SupervisorConfig) -> Arc<Self> {
        let (death_tx, death_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            backend,
            classifier,
            ledger: Arc::new(RetryLedger::new()),
            error_ring: Arc::new(ErrorRing::new()),
            config,
            next_worker_id: AtomicU64::new(1),
            supervising: AtomicBool::new(false),
            active: Mutex::new(HashMap::new()),
            dead: Mutex::new(HashMap::new()),
            slots: RwLock::new(None),
            death_tx,
            death_rx: Mutex::new(Some(death_rx)),
            reaper_started: AtomicBool::new(false),
            fatal_outcome: Mutex::new(None),
            fatal_signal: Notify::new(),
        })
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    pub fn error_ring(&self) -> &ErrorRing {
        &self.error_ring
    }

    /// Validates `queue_name`, runs the broker/queue preflight checks, and
    /// spawns `listener_threads` workers bound to `queue_name` and
    /// `registry`.
    pub async fn start(
        self: &Arc<Self>,
        queue_name: impl Into<String>,
        registry: Arc<HandlerRegistry>,
    ) -> Result<(), SupervisorError> {
        let queue_name = queue_name.into();
        if queue_name.is_empty() {
            return Err(SupervisorError::EmptyQueueName);
        }
        if queue_name.len() > self.config.max_queue_name_length {
            return Err(SupervisorError::QueueNameTooLong {
                max: self.config.max_queue_name_length,
            });
        }

        if !self
            .backend
            .is_service_broker_enabled()
            .await
            .map_err(|e| SupervisorError::Preflight(e.to_string()))?
        {
            return Err(SupervisorError::BrokerDisabled);
        }
        if !self
            .backend
            .is_queue_enabled(&queue_name)
            .await
            .map_err(|e| SupervisorError::Preflight(e.to_string()))?
        {
            return Err(SupervisorError::QueueDisabled(queue_name));
        }

        let services = Arc::new(Services {
            backend: self.backend.clone(),
            classifier: self.classifier.clone(),
            registry,
            ledger: self.ledger.clone(),
            error_ring: self.error_ring.clone(),
            config: WorkerRuntimeConfig {
                queue_name: queue_name.clone(),
                max_retries: self.config.max_retries,
            },
        });

        *self.slots.write() = Some(services.clone());
        self.supervising.store(true, Ordering::SeqCst);
        self.ensure_reaper_started();

        for _ in 0..self.config.listener_threads {
            let id = self.next_worker_id();
            self.spawn_worker(id, services.clone());
        }

        info!(queue_name = %services.config.queue_name, listener_threads = self.config.listener_threads, "supervisor started");
        Ok(())
    }

    /// Cooperative-then-forced shutdown: cancel every worker, wait up to
    /// `graceful_timeout`, abort any still running, clear the retry ledger,
    /// and optionally drop the preserved slots.
    pub async fn stop(self: &Arc<Self>, clear_state: bool) {
        self.supervising.store(false, Ordering::SeqCst);

        let workers: Vec<ActiveWorker> = self.active.lock().drain().map(|(_, w)| w).collect();
        for worker in &workers {
            worker.cancel.cancel();
        }

        let abort_handles: Vec<_> = workers.iter().map(|w| w.task.abort_handle()).collect();
        let tasks: Vec<JoinHandle<()>> = workers.into_iter().map(|w| w.task).collect();

        if tokio::time::timeout(self.config.graceful_timeout, join_all(tasks))
            .await
            .is_err()
        {
            warn!("graceful_timeout elapsed with workers still draining; aborting stragglers");
            for handle in abort_handles {
                handle.abort();
            }
        }

        self.ledger.clear_all();

        if clear_state {
            *self.slots.write() = None;
            self.dead.lock().clear();
        }

        info!(clear_state, "supervisor stopped");
    }

    /// Stop keeping preserved state, pause briefly, then start again with
    /// the same `queueName`/registry.
    pub async fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let services = self
            .slots
            .read()
            .clone()
            .ok_or(SupervisorError::NoPreservedState)?;

        self.stop(false).await;
        tokio::time::sleep(self.config.restart_settle_pause).await;
        self.supervising.store(true, Ordering::SeqCst);

        for _ in 0..self.config.listener_threads {
            let id = self.next_worker_id();
            self.spawn_worker(id, services.clone());
        }

        info!("supervisor restarted");
        Ok(())
    }

    /// Manual safety hatch: replace every worker whose terminal outcome is
    /// known and Fatal-Worker under a fresh `workerId`. A no-op if there is
    /// nothing dead or no preserved state to rebind to.
    pub async fn restart_failed(self: &Arc<Self>) {
        let services = match self.slots.read().clone() {
            Some(services) => services,
            None => {
                warn!("restart_failed called with no preserved supervisor state");
                return;
            }
        };

        let failed: Vec<u64> = self.dead.lock().drain().map(|(id, _)| id).collect();
        for old_id in failed {
            let new_id = self.next_worker_id();
            info!(old_worker_id = old_id, new_worker_id = new_id, "restarting failed worker");
            self.spawn_worker(new_id, services.clone());
        }
    }

    /// `isHealthy() = supervising ∧ executor-alive ∧ activeCount ==
    /// configuredCount`. The reaper task standing in for "executor-alive":
    /// it is spawned once, for the supervisor's whole lifetime, the first
    /// time `start` runs.
    pub fn is_healthy(&self) -> bool {
        self.supervising.load(Ordering::SeqCst)
            && self.reaper_started.load(Ordering::SeqCst)
            && self.active.lock().len() == self.config.listener_threads
    }

    pub fn worker_contexts(&self) -> Vec<WorkerContext> {
        self.active
            .lock()
            .values()
            .map(|w| WorkerContext {
                worker_id: w.worker_id,
                started_at: w.started_at,
                telemetry: w.telemetry.snapshot(),
            })
            .collect()
    }

    pub fn aggregate_snapshot(&self) -> AggregateSnapshot {
        let snapshots: Vec<WorkerSnapshot> = self
            .active
            .lock()
            .values()
            .map(|w| w.telemetry.snapshot())
            .collect();
        summarize(
            &snapshots,
            self.config.listener_threads,
            self.supervising.load(Ordering::SeqCst),
            self.config.error_rate_threshold,
        )
    }

    /// Blocks until a worker reports a process-fatal outcome. `relay-daemon`
    /// awaits this alongside its signal handlers to centralize the
    /// exit-code decision.
    pub async fn wait_for_fatal_process_fault(&self) -> WorkerOutcome {
        loop {
            let notified = self.fatal_signal.notified();
            if let Some(outcome) = *self.fatal_outcome.lock() {
                return outcome;
            }
            notified.await;
        }
    }

    fn next_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::SeqCst)
    }

    fn spawn_worker(self: &Arc<Self>, worker_id: u64, services: Arc<Services<B>>) {
        let telemetry = Arc::new(WorkerTelemetry::new());
        let cancel = CancellationToken::new();
        let worker = ListenerWorker::new(worker_id, services, telemetry.clone(), cancel.clone());
        let death_tx = self.death_tx.clone();

        let task = tokio::spawn(async move {
            let outcome = worker.run().await;
            let _ = death_tx.send((worker_id, outcome));
        });

        self.active.lock().insert(
            worker_id,
            ActiveWorker {
                worker_id,
                started_at: Utc::now(),
                telemetry,
                cancel,
                task,
            },
        );
    }

    /// Spawns the reaper task exactly once per supervisor lifetime, the
    /// first time `start` runs.
    fn ensure_reaper_started(self: &Arc<Self>) {
        if self.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }

        // `reaper_started`'s CAS above guarantees this branch runs at most
        // once, so the receiver is always still here to take; if it isn't,
        // there is nothing to reap and starting a second reaper would be
        // wrong anyway, so we just skip it rather than panicking.
        let Some(mut rx) = self.death_rx.lock().take() else {
            return;
        };
        let supervisor = Arc::clone(self);

        tokio::spawn(async move {
            while let Some((worker_id, outcome)) = rx.recv().await {
                supervisor.on_worker_death(worker_id, outcome).await;
            }
        });
    }

    /// The worker-death callback: runs on the reaper task, never on the
    /// dying worker's own task.
    async fn on_worker_death(self: &Arc<Self>, worker_id: u64, outcome: WorkerOutcome) {
        self.active.lock().remove(&worker_id);

        match outcome {
            WorkerOutcome::Graceful => {}
            WorkerOutcome::FatalWorker => {
                if self.supervising.load(Ordering::SeqCst) {
                    warn!(worker_id, "worker stopped on a fatal configuration error; awaiting restart_failed");
                    self.dead.lock().insert(worker_id, outcome);
                }
            }
            WorkerOutcome::FatalProcessImmediate | WorkerOutcome::FatalProcessGraceful => {
                error!(worker_id, ?outcome, "worker observed a process-fatal condition");
                *self.fatal_outcome.lock() = Some(outcome);
                self.fatal_signal.notify_waiters();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_common::error::ClassifierConfig;
    use relay_common::registry::{ChangeHandler, HandlerError, HandlerRegistration};
    use relay_common::types::{ChangeEvent, ConversationHandle, RawMessage};
    use relay_queue::fake::FakeQueue;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration as StdDuration;

    struct NoopHandler(AtomicUsize);

    #[async_trait]
    impl ChangeHandler for NoopHandler {
        async fn on_insert(&self, _event: &ChangeEvent) -> Result<(), HandlerError> {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    fn raw(handle: &str) -> RawMessage {
        RawMessage {
            conversation_handle: ConversationHandle::from(handle),
            message_type_name: "relay/change-event".to_string(),
            message_body: r#"{"eventId":"E1","tableName":"users","operation":"INSERT"}"#
                .to_string(),
            enqueued_at: Utc::now(),
            sequence_number: Some(1),
            priority: None,
            service_name: None,
            contract_name: None,
            conversation_group_id: None,
            received_at: Utc::now(),
            worker_id: 0,
        }
    }

    fn supervisor(listener_threads: usize) -> (Arc<Supervisor<FakeQueue>>, Arc<FakeQueue>) {
        let queue = Arc::new(FakeQueue::new());
        queue.enable_queue("q");
        let classifier = Arc::new(ErrorClassifier::new(ClassifierConfig::default()));
        let config = SupervisorConfig {
            listener_threads,
            graceful_timeout: StdDuration::from_millis(200),
            restart_settle_pause: StdDuration::from_millis(5),
            ..SupervisorConfig::default()
        };
        (Supervisor::new(queue.clone(), classifier, config), queue)
    }

    async fn registry_with_users_handler() -> Arc<HandlerRegistry> {
        let handler = Arc::new(NoopHandler(AtomicUsize::new(0)));
        let registrations = vec![HandlerRegistration::new(
            "users",
            "users",
            handler,
            [relay_common::types::ChangeType::Insert]
                .into_iter()
                .collect::<HashSet<_>>(),
        )];
        Arc::new(HandlerRegistry::build(registrations).await.unwrap())
    }

    #[tokio::test]
    async fn start_rejects_an_empty_queue_name() {
        let (supervisor, _queue) = supervisor(1);
        let registry = registry_with_users_handler().await;
        let result = supervisor.start("", registry).await;
        assert!(matches!(result, Err(SupervisorError::EmptyQueueName)));
    }

    #[tokio::test]
    async fn start_rejects_a_disabled_queue() {
        let (supervisor, queue) = supervisor(1);
        queue.disable_service_broker();
        let registry = registry_with_users_handler().await;
        let result = supervisor.start("q", registry).await;
        assert!(matches!(result, Err(SupervisorError::BrokerDisabled)));
    }

    #[tokio::test]
    async fn start_spawns_configured_worker_count_and_reports_healthy() {
        let (supervisor, _queue) = supervisor(3);
        let registry = registry_with_users_handler().await;
        supervisor.start("q", registry).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(supervisor.worker_contexts().len(), 3);
        assert!(supervisor.is_healthy());

        supervisor.stop(true).await;
        assert!(!supervisor.is_healthy());
        assert_eq!(supervisor.worker_contexts().len(), 0);
    }

    #[tokio::test]
    async fn stop_drains_in_flight_work_within_the_graceful_timeout() {
        let (supervisor, queue) = supervisor(2);
        queue.enqueue(raw("conv-1"));
        let registry = registry_with_users_handler().await;
        supervisor.start("q", registry).await.unwrap();

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        supervisor.stop(true).await;

        assert_eq!(queue.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn restart_without_prior_start_is_an_error() {
        let (supervisor, _queue) = supervisor(1);
        let result = supervisor.restart().await;
        assert!(matches!(result, Err(SupervisorError::NoPreservedState)));
    }

    #[tokio::test]
    async fn unique_worker_ids_across_a_restart() {
        let (supervisor, _queue) = supervisor(2);
        let registry = registry_with_users_handler().await;
        supervisor.start("q", registry).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let first_ids: HashSet<u64> = supervisor
            .worker_contexts()
            .into_iter()
            .map(|c| c.worker_id)
            .collect();

        supervisor.restart().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let second_ids: HashSet<u64> = supervisor
            .worker_contexts()
            .into_iter()
            .map(|c| c.worker_id)
            .collect();

        assert!(first_ids.is_disjoint(&second_ids));
        assert!(second_ids.iter().all(|id| first_ids.iter().all(|f| id > f)));

        supervisor.stop(true).await;
    }
}
