//! Postgres reference implementation of `QueueBackend`. Service Broker's
//! `WAITFOR (RECEIVE TOP(1) …)` has no Postgres equivalent, so the blocking
//! receive is emulated with `SELECT … FOR UPDATE SKIP LOCKED` inside an
//! explicitly-managed transaction, polled on an interval and interleaved
//! with the cancellation token — the same polling shape the worker pool's
//! job-wait loop already uses elsewhere in this codebase.
//!
//! Schema assumed to exist (created by a migration outside this crate's
//! scope):
//!
//! ```sql
//! CREATE TABLE relay_queues (
//!     queue_name TEXT PRIMARY KEY,
//!     enabled BOOLEAN NOT NULL DEFAULT true
//! );
//!
//! CREATE TABLE relay_queue_messages (
//!     conversation_handle TEXT PRIMARY KEY,
//!     queue_name TEXT NOT NULL,
//!     message_type_name TEXT NOT NULL,
//!     message_body TEXT NOT NULL,
//!     message_enqueue_time TIMESTAMPTZ NOT NULL,
//!     message_sequence_number BIGINT,
//!     priority INT,
//!     service_name TEXT,
//!     service_contract_name TEXT,
//!     conversation_group_id TEXT,
//!     state TEXT NOT NULL DEFAULT 'available',
//!     ack_reason TEXT
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_common::types::{ConversationHandle, RawMessage};
use sqlx::postgres::PgRow;
use sqlx::{Connection, Row};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::QueueBackend;
use crate::config::PgBackendConfig;
use crate::error::QueueError;

pub struct PgBackend {
    config: PgBackendConfig,
}

impl PgBackend {
    pub fn new(config: PgBackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl QueueBackend for PgBackend {
    type Connection = sqlx::PgConnection;

    async fn acquire(&self) -> Result<Self::Connection, QueueError> {
        let connect = sqlx::PgConnection::connect(&self.config.database_url);
        let conn = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| QueueError::Database {
                code: Some("HYT00".to_string()),
                message: "timed out connecting to database".to_string(),
            })?
            .map_err(QueueError::database)?;
        Ok(conn)
    }

    async fn receive(
        &self,
        conn: &mut Self::Connection,
        queue_name: &str,
        worker_id: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<RawMessage>, QueueError> {
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(QueueError::database)?;

        loop {
            if cancel.is_cancelled() {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Ok(None);
            }

            let row = sqlx::query(
                r#"
                SELECT conversation_handle, message_type_name, message_body,
                       message_enqueue_time, message_sequence_number, priority,
                       service_name, service_contract_name, conversation_group_id
                FROM relay_queue_messages
                WHERE queue_name = $1 AND state = 'available'
                ORDER BY priority ASC NULLS LAST, message_sequence_number ASC NULLS LAST
                FOR UPDATE SKIP LOCKED
                LIMIT 1
                "#,
            )
            .bind(queue_name)
            .fetch_optional(&mut *conn)
            .await
            .map_err(QueueError::database)?;

            if let Some(row) = row {
                let handle: String =
                    row.try_get("conversation_handle").map_err(QueueError::database)?;

                sqlx::query("UPDATE relay_queue_messages SET state = 'locked' WHERE conversation_handle = $1")
                    .bind(&handle)
                    .execute(&mut *conn)
                    .await
                    .map_err(QueueError::database)?;

                debug!(conversation_handle = %handle, %worker_id, "dequeued message");
                return Ok(Some(raw_message_from_row(row, worker_id)?));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                    return Ok(None);
                }
                _ = tokio::time::sleep(self.config.poll_interval) => continue,
            }
        }
    }

    async fn end_conversation(
        &self,
        conn: &mut Self::Connection,
        handle: &ConversationHandle,
        reason: &str,
    ) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE relay_queue_messages SET state = 'acknowledged', ack_reason = $2 WHERE conversation_handle = $1",
        )
        .bind(handle.as_str())
        .bind(reason)
        .execute(&mut *conn)
        .await
        .map_err(QueueError::database)?;
        Ok(())
    }

    async fn commit(&self, conn: &mut Self::Connection) -> Result<(), QueueError> {
        sqlx::query("COMMIT")
            .execute(conn)
            .await
            .map_err(QueueError::database)?;
        Ok(())
    }

    async fn rollback(&self, conn: &mut Self::Connection) -> Result<(), QueueError> {
        sqlx::query("ROLLBACK")
            .execute(conn)
            .await
            .map_err(QueueError::database)?;
        Ok(())
    }

    async fn close(&self, conn: Self::Connection) -> Result<(), QueueError> {
        conn.close().await.map_err(QueueError::database)
    }

    async fn cancel_receive(&self, _conn: &Self::Connection) -> Result<(), QueueError> {
        // The receive loop already selects on the cancellation token passed
        // into it; there is no separate blocking call to interrupt here.
        Ok(())
    }

    async fn is_service_broker_enabled(&self) -> Result<bool, QueueError> {
        let mut conn = self.acquire().await?;
        let row: (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM relay_queues)")
            .fetch_one(&mut conn)
            .await
            .map_err(QueueError::database)?;
        let _ = conn.close().await;
        Ok(row.0)
    }

    async fn is_queue_enabled(&self, queue_name: &str) -> Result<bool, QueueError> {
        let mut conn = self.acquire().await?;
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT enabled FROM relay_queues WHERE queue_name = $1")
                .bind(queue_name)
                .fetch_optional(&mut conn)
                .await
                .map_err(QueueError::database)?;
        let _ = conn.close().await;
        Ok(row.map(|(enabled,)| enabled).unwrap_or(false))
    }
}

fn raw_message_from_row(row: PgRow, worker_id: u64) -> Result<RawMessage, QueueError> {
    let conversation_handle: String =
        row.try_get("conversation_handle").map_err(QueueError::database)?;
    let message_type_name: String =
        row.try_get("message_type_name").map_err(QueueError::database)?;
    let message_body: String = row.try_get("message_body").map_err(QueueError::database)?;
    let enqueued_at: DateTime<Utc> =
        row.try_get("message_enqueue_time").map_err(QueueError::database)?;
    let sequence_number: Option<i64> =
        row.try_get("message_sequence_number").map_err(QueueError::database)?;
    let priority: Option<i32> = row.try_get("priority").map_err(QueueError::database)?;
    let service_name: Option<String> =
        row.try_get("service_name").map_err(QueueError::database)?;
    let contract_name: Option<String> =
        row.try_get("service_contract_name").map_err(QueueError::database)?;
    let conversation_group_id: Option<String> =
        row.try_get("conversation_group_id").map_err(QueueError::database)?;

    Ok(RawMessage {
        conversation_handle: ConversationHandle::from(conversation_handle),
        message_type_name,
        message_body,
        enqueued_at,
        sequence_number,
        priority,
        service_name,
        contract_name,
        conversation_group_id,
        received_at: Utc::now(),
        worker_id,
    })
}
