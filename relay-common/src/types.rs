//! Core data model shared by every relay component: the message the queue
//! hands us, the event the dispatcher hands to handlers, and the
//! registration a handler is bound under.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Opaque identity of an in-queue conversation. Cheap to clone: the worker,
/// the retry ledger, and telemetry all hold one per in-flight message.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConversationHandle(Arc<str>);

impl ConversationHandle {
    pub fn new(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationHandle {
    fn from(value: &str) -> Self {
        Self::new(Arc::from(value))
    }
}

impl From<String> for ConversationHandle {
    fn from(value: String) -> Self {
        Self::new(Arc::from(value.as_str()))
    }
}

/// The kind of row mutation a data message describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    /// Parses `operation` case-insensitively, the way the wire format
    /// requires.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeType::Insert),
            "UPDATE" => Some(ChangeType::Update),
            "DELETE" => Some(ChangeType::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The well-known Service-Broker-equivalent system message URIs. Any
/// `messageTypeName` that doesn't match one of these is a data message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemMessageType {
    EndDialog,
    Error,
    DialogTimer,
    Other,
}

impl SystemMessageType {
    const END_DIALOG: &'static str = "http://schemas.microsoft.com/SQL/ServiceBroker/EndDialog";
    const ERROR: &'static str = "http://schemas.microsoft.com/SQL/ServiceBroker/Error";
    const DIALOG_TIMER: &'static str = "http://schemas.microsoft.com/SQL/ServiceBroker/DialogTimer";

    /// Returns `Some` with the classified system type (and the cleanup reason
    /// to acknowledge with) if `message_type_name` is a known system URI,
    /// `None` if this is a data message.
    pub fn classify(message_type_name: &str) -> Option<(Self, String)> {
        match message_type_name {
            Self::END_DIALOG => Some((Self::EndDialog, "EndDialog cleanup".to_string())),
            Self::ERROR => Some((Self::Error, "Error message cleanup".to_string())),
            Self::DIALOG_TIMER => Some((Self::DialogTimer, "Timer expiry cleanup".to_string())),
            other if other.starts_with("http://schemas.microsoft.com/SQL/ServiceBroker/") => {
                Some((
                    Self::Other,
                    format!("Unknown system message cleanup: {other}"),
                ))
            }
            _ => None,
        }
    }
}

/// One row as handed to us by `QueueDequeuer::receive`. Immutable after
/// creation; discarded after the worker's next commit-or-rollback.
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub conversation_handle: ConversationHandle,
    pub message_type_name: String,
    pub message_body: String,
    pub enqueued_at: DateTime<Utc>,
    pub sequence_number: Option<i64>,
    pub priority: Option<i32>,
    pub service_name: Option<String>,
    pub contract_name: Option<String>,
    pub conversation_group_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub worker_id: u64,
}

impl RawMessage {
    /// A message is a *data message* iff its type name does not match one of
    /// the known system URIs.
    pub fn is_data_message(&self) -> bool {
        SystemMessageType::classify(&self.message_type_name).is_none()
    }

    pub fn system_message_type(&self) -> Option<(SystemMessageType, String)> {
        SystemMessageType::classify(&self.message_type_name)
    }
}

/// A parsed, typed representation of one table mutation.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub event_id: String,
    /// Canonicalized upper-case table name.
    pub table_name: String,
    pub change_type: ChangeType,
    pub event_time: DateTime<Utc>,
    pub received_time: DateTime<Utc>,
    pub raw_record: Map<String, Value>,
    /// Present only when the registered handler declares a specific record
    /// type and conversion from `raw_record` succeeded.
    pub typed_record: Option<Value>,
    pub conversation_handle: ConversationHandle,
    pub message_type_name: String,
}

impl ChangeEvent {
    /// An empty `record` object yields an empty raw mapping and no typed
    /// record; the handler is still invoked rather than skipped.
    pub fn raw_record_is_empty(&self) -> bool {
        self.raw_record.is_empty()
    }
}
