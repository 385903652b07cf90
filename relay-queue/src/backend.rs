//! `QueueBackend`: the external collaborator that opens connections and
//! dequeues messages. `ConnectionManager` and `QueueDequeuer` are one trait
//! here — a worker only ever needs a connection and the backend that opened
//! it, and keeping them together avoids threading two generic parameters
//! with a shared associated type through every caller.
//!
//! `ConnectionManager`'s "safe" wrappers (never raise, log on failure) are
//! default methods here rather than a separate façade, so every backend gets
//! them for free.

use async_trait::async_trait;
use relay_common::types::{ConversationHandle, RawMessage};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::QueueError;

#[async_trait]
pub trait QueueBackend: Send + Sync + 'static {
    type Connection: Send;

    /// Returns a connection with auto-commit disabled. Failure is always
    /// Fatal-DB at ignition.
    async fn acquire(&self) -> Result<Self::Connection, QueueError>;

    /// Blocks until a message arrives or `cancel` fires; `Ok(None)` on
    /// cancellation or an empty receive, never both an error and a message.
    async fn receive(
        &self,
        conn: &mut Self::Connection,
        queue_name: &str,
        worker_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<RawMessage>, QueueError>;

    /// The acknowledge statement's non-commit half: ends the conversation.
    /// The caller issues `commit` separately so acknowledge-then-commit
    /// stays atomic on the same connection.
    async fn end_conversation(
        &self,
        conn: &mut Self::Connection,
        handle: &ConversationHandle,
        reason: &str,
    ) -> Result<(), QueueError>;

    async fn commit(&self, conn: &mut Self::Connection) -> Result<(), QueueError>;
    async fn rollback(&self, conn: &mut Self::Connection) -> Result<(), QueueError>;
    async fn close(&self, conn: Self::Connection) -> Result<(), QueueError>;

    /// Unblocks an in-flight `receive` on another task holding `conn`. A
    /// polling backend can satisfy this purely through `cancel`; a backend
    /// with a genuine blocking call needs a side channel (an admin
    /// connection issuing a cancel request) keyed off `conn`.
    async fn cancel_receive(&self, conn: &Self::Connection) -> Result<(), QueueError>;

    async fn is_service_broker_enabled(&self) -> Result<bool, QueueError>;
    async fn is_queue_enabled(&self, queue_name: &str) -> Result<bool, QueueError>;

    /// `safeRollback`: never raises, logs on failure.
    async fn safe_rollback(&self, conn: &mut Self::Connection) {
        if let Err(error) = self.rollback(conn).await {
            warn!(%error, "rollback failed during cleanup");
        }
    }

    /// `safeClose`.
    async fn safe_close(&self, conn: Self::Connection) {
        if let Err(error) = self.close(conn).await {
            warn!(%error, "connection close failed during cleanup");
        }
    }

    /// `safeCloseWithRollback`.
    async fn safe_close_with_rollback(&self, mut conn: Self::Connection) {
        self.safe_rollback(&mut conn).await;
        self.safe_close(conn).await;
    }

    /// `safeCancel`.
    async fn safe_cancel(&self, conn: &Self::Connection) {
        if let Err(error) = self.cancel_receive(conn).await {
            warn!(%error, "cancel failed during cleanup");
        }
    }

    /// `interruptBlockingReceive`: cancel the in-flight call, then close.
    async fn interrupt_blocking_receive(&self, conn: Self::Connection) {
        self.safe_cancel(&conn).await;
        self.safe_close(conn).await;
    }
}
