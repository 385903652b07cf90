//! In-memory `QueueBackend` used by `relay-worker`/`relay-supervisor` tests
//! and by anything exercising the dispatcher without a database.

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_common::types::{ConversationHandle, RawMessage};
use tokio_util::sync::CancellationToken;

use crate::backend::QueueBackend;
use crate::error::QueueError;

/// A fake connection carries no state of its own; everything lives in
/// `FakeQueue`.
pub struct FakeConnection;

struct FakeQueueState {
    available: VecDeque<RawMessage>,
    in_flight: Vec<RawMessage>,
    acknowledged: Vec<(ConversationHandle, String)>,
    service_broker_enabled: bool,
    enabled_queues: Vec<String>,
}

/// Enqueue messages with [`FakeQueue::enqueue`], then hand `Arc<FakeQueue>`
/// to a worker exactly as a `PgBackend` would be. `receive` returns `None`
/// immediately once the queue is drained and stays empty, rather than
/// blocking forever, so tests don't need a real cancellation deadline.
pub struct FakeQueue {
    state: Mutex<FakeQueueState>,
}

impl FakeQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeQueueState {
                available: VecDeque::new(),
                in_flight: Vec::new(),
                acknowledged: Vec::new(),
                service_broker_enabled: true,
                enabled_queues: Vec::new(),
            }),
        }
    }

    pub fn enqueue(&self, message: RawMessage) {
        self.state.lock().available.push_back(message);
    }

    pub fn enable_queue(&self, queue_name: impl Into<String>) {
        self.state.lock().enabled_queues.push(queue_name.into());
    }

    pub fn disable_service_broker(&self) {
        self.state.lock().service_broker_enabled = false;
    }

    pub fn acknowledged(&self) -> Vec<(ConversationHandle, String)> {
        self.state.lock().acknowledged.clone()
    }

    pub fn available_len(&self) -> usize {
        self.state.lock().available.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl Default for FakeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for FakeQueue {
    type Connection = FakeConnection;

    async fn acquire(&self) -> Result<Self::Connection, QueueError> {
        Ok(FakeConnection)
    }

    async fn receive(
        &self,
        _conn: &mut Self::Connection,
        queue_name: &str,
        worker_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<RawMessage>, QueueError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let _ = queue_name;
        let mut state = self.state.lock();
        match state.available.pop_front() {
            Some(mut message) => {
                message.worker_id = worker_id;
                state.in_flight.push(message.clone());
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    async fn end_conversation(
        &self,
        _conn: &mut Self::Connection,
        handle: &ConversationHandle,
        reason: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.in_flight.retain(|m| &m.conversation_handle != handle);
        state
            .acknowledged
            .push((handle.clone(), reason.to_string()));
        Ok(())
    }

    async fn commit(&self, _conn: &mut Self::Connection) -> Result<(), QueueError> {
        Ok(())
    }

    async fn rollback(&self, _conn: &mut Self::Connection) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if let Some(message) = state.in_flight.pop() {
            state.available.push_front(message);
        }
        Ok(())
    }

    async fn close(&self, _conn: Self::Connection) -> Result<(), QueueError> {
        Ok(())
    }

    async fn cancel_receive(&self, _conn: &Self::Connection) -> Result<(), QueueError> {
        Ok(())
    }

    async fn is_service_broker_enabled(&self) -> Result<bool, QueueError> {
        Ok(self.state.lock().service_broker_enabled)
    }

    async fn is_queue_enabled(&self, queue_name: &str) -> Result<bool, QueueError> {
        Ok(self
            .state
            .lock()
            .enabled_queues
            .iter()
            .any(|q| q == queue_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(handle: &str) -> RawMessage {
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

    #[tokio::test]
    async fn receive_returns_enqueued_message_then_empty() {
        let queue = FakeQueue::new();
        queue.enqueue(message("conv-1"));
        let mut conn = queue.acquire().await.unwrap();
        let cancel = CancellationToken::new();

        let received = queue.receive(&mut conn, "q", 7, &cancel).await.unwrap();
        assert_eq!(
            received.unwrap().conversation_handle,
            ConversationHandle::from("conv-1")
        );

        let empty = queue.receive(&mut conn, "q", 7, &cancel).await.unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn rollback_requeues_the_in_flight_message() {
        let queue = FakeQueue::new();
        queue.enqueue(message("conv-1"));
        let mut conn = queue.acquire().await.unwrap();
        let cancel = CancellationToken::new();

        queue.receive(&mut conn, "q", 1, &cancel).await.unwrap();
        assert_eq!(queue.in_flight_len(), 1);

        queue.rollback(&mut conn).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.available_len(), 1);
    }

    #[tokio::test]
    async fn end_conversation_records_the_reason() {
        let queue = FakeQueue::new();
        queue.enqueue(message("conv-1"));
        let mut conn = queue.acquire().await.unwrap();
        let cancel = CancellationToken::new();

        queue.receive(&mut conn, "q", 1, &cancel).await.unwrap();
        queue
            .end_conversation(&mut conn, &ConversationHandle::from("conv-1"), "processed")
            .await
            .unwrap();

        let acked = queue.acknowledged();
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].1, "processed");
        assert_eq!(queue.in_flight_len(), 0);
    }
}
