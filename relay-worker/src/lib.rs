//! `ListenerWorker` and `Dispatcher`: the per-worker
//! dequeue/dispatch/acknowledge-or-retry cycle.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod dispatcher;
pub mod worker;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use worker::{ListenerWorker, Services, WorkerOutcome, WorkerRuntimeConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use relay_common::error::{ClassifierConfig, ErrorClassifier};
    use relay_common::registry::{ChangeHandler, HandlerError, HandlerRegistration, HandlerRegistry};
    use relay_common::retry::RetryLedger;
    use relay_common::telemetry::{ErrorRing, WorkerTelemetry};
    use relay_common::types::{ChangeEvent, ConversationHandle, RawMessage};
    use relay_queue::fake::FakeQueue;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn raw(handle: &str, body: &str) -> RawMessage {
        RawMessage {
            conversation_handle: ConversationHandle::from(handle),
            message_type_name: "relay/change-event".to_string(),
            message_body: body.to_string(),
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

    fn all_ops() -> HashSet<relay_common::types::ChangeType> {
        use relay_common::types::ChangeType;
        [ChangeType::Insert, ChangeType::Update, ChangeType::Delete]
            .into_iter()
            .collect()
    }

    fn fast_classifier(max_retries: u32) -> (Arc<ErrorClassifier>, u32) {
        let mut config = ClassifierConfig::default();
        config.base_retry_delay = Duration::from_millis(1);
        config.max_retry_delay = Duration::from_millis(5);
        (Arc::new(ErrorClassifier::new(config)), max_retries)
    }

    async fn run_to_completion<B: relay_queue::backend::QueueBackend>(
        services: Arc<Services<B>>,
    ) -> WorkerOutcome {
        let telemetry = Arc::new(WorkerTelemetry::new());
        let cancel = CancellationToken::new();
        // The fake backend never blocks, so a worker that drains the queue
        // would spin forever; cancel it once nothing is left in flight.
        let worker = ListenerWorker::new(1, services.clone(), telemetry, cancel.clone());
        let handle = tokio::spawn(worker.run());
        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if services.backend.available_len() == 0 && services.backend.in_flight_len() == 0 {
                cancel.cancel();
                break;
            }
        }
        handle.await.unwrap()
    }

    struct RecordingHandler {
        seen_ids: parking_lot::Mutex<Vec<String>>,
        fail_times: AtomicUsize,
    }

    impl RecordingHandler {
        fn new(fail_times: usize) -> Self {
            Self {
                seen_ids: parking_lot::Mutex::new(Vec::new()),
                fail_times: AtomicUsize::new(fail_times),
            }
        }
    }

    #[async_trait]
    impl ChangeHandler for RecordingHandler {
        async fn on_insert(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                return Err(HandlerError::new("transient"));
            }
            self.seen_ids.lock().push(event.event_id.clone());
            assert_eq!(event.table_name, "USERS");
            Ok(())
        }
    }

    async fn services_with(
        handler: Arc<dyn ChangeHandler>,
        max_retries: u32,
    ) -> (Arc<Services<FakeQueue>>, Arc<FakeQueue>) {
        let queue = Arc::new(FakeQueue::new());
        let registrations = vec![HandlerRegistration::new(
            "users",
            "users",
            handler,
            all_ops(),
        )];
        let registry = Arc::new(HandlerRegistry::build(registrations).await.unwrap());
        let (classifier, max_retries) = fast_classifier(max_retries);

        let services = Arc::new(Services {
            backend: queue.clone(),
            classifier,
            registry,
            ledger: Arc::new(RetryLedger::new()),
            error_ring: Arc::new(ErrorRing::new()),
            config: WorkerRuntimeConfig {
                queue_name: "q".to_string(),
                max_retries,
            },
        });
        (services, queue)
    }

    #[tokio::test]
    async fn happy_path_drains_the_queue_and_clears_retry_state() {
        let handler = Arc::new(RecordingHandler::new(0));
        let (services, queue) = services_with(handler.clone(), 3).await;
        queue.enqueue(raw(
            "conv-1",
            r#"{"eventId":"E1","tableName":"users","operation":"INSERT","record":{"id":7}}"#,
        ));

        let outcome = run_to_completion(services.clone()).await;

        assert_eq!(outcome, WorkerOutcome::Graceful);
        assert_eq!(handler.seen_ids.lock().as_slice(), ["E1"]);
        assert_eq!(services.ledger.size(), 0);
    }

    #[tokio::test]
    async fn retry_then_success_clears_state_after_one_retry() {
        let handler = Arc::new(RecordingHandler::new(1));
        let (services, queue) = services_with(handler.clone(), 3).await;
        queue.enqueue(raw(
            "conv-1",
            r#"{"eventId":"E1","tableName":"users","operation":"INSERT"}"#,
        ));

        let outcome = run_to_completion(services.clone()).await;

        assert_eq!(outcome, WorkerOutcome::Graceful);
        assert_eq!(handler.seen_ids.lock().as_slice(), ["E1"]);
        assert_eq!(services.ledger.size(), 0);
    }

    #[tokio::test]
    async fn poisoning_by_retry_exhaustion_acknowledges_with_a_reason() {
        let handler = Arc::new(RecordingHandler::new(100));
        let (services, queue) = services_with(handler, 2).await;
        queue.enqueue(raw(
            "conv-1",
            r#"{"eventId":"E1","tableName":"users","operation":"INSERT"}"#,
        ));

        run_to_completion(services.clone()).await;

        let acked = services.backend.acknowledged();
        assert_eq!(acked.len(), 1);
        assert!(acked[0].1.starts_with("poisoned"));
        assert_eq!(services.ledger.size(), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_poisoned_without_invoking_the_handler() {
        let handler = Arc::new(RecordingHandler::new(0));
        let (services, queue) = services_with(handler.clone(), 3).await;
        queue.enqueue(raw("conv-1", "{ not json"));

        run_to_completion(services.clone()).await;

        assert!(handler.seen_ids.lock().is_empty());
        let acked = services.backend.acknowledged();
        assert_eq!(acked.len(), 1);
        assert!(acked[0].1.starts_with("poisoned"));
    }

    #[tokio::test]
    async fn unknown_table_is_acknowledged_and_retry_ledger_untouched() {
        let handler = Arc::new(RecordingHandler::new(0));
        let (services, queue) = services_with(handler, 3).await;
        queue.enqueue(raw(
            "conv-1",
            r#"{"eventId":"E1","tableName":"orders","operation":"INSERT"}"#,
        ));

        run_to_completion(services.clone()).await;

        let acked = services.backend.acknowledged();
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].1, "unsubscribed table");
        assert_eq!(services.ledger.size(), 0);
    }

    #[tokio::test]
    async fn graceful_shutdown_leaves_nothing_uncommitted() {
        let handler = Arc::new(RecordingHandler::new(1000));
        let (services, queue) = services_with(handler, 1000).await;
        queue.enqueue(raw(
            "conv-1",
            r#"{"eventId":"E1","tableName":"users","operation":"INSERT"}"#,
        ));

        let telemetry = Arc::new(WorkerTelemetry::new());
        let cancel = CancellationToken::new();
        let worker = ListenerWorker::new(1, services.clone(), telemetry, cancel.clone());
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();

        assert_eq!(outcome, WorkerOutcome::Graceful);
        assert_eq!(services.backend.in_flight_len(), 0);
    }
}
