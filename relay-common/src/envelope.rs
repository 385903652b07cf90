//! `EnvelopeParser`: parses a data message's JSON body into a `ChangeEvent`,
//! poisoning on malformed JSON or a missing/invalid required field, and
//! falling back to wall-clock time (without poisoning) when `timestamp` is
//! present but unparseable.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::Failure;
use crate::registry::ChangeHandler;
use crate::types::{ChangeEvent, ChangeType, RawMessage};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    table_name: Option<String>,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    record: Option<Value>,
    // Unknown top-level fields are ignored by serde_json's default behavior.
}

pub struct EnvelopeParser;

impl EnvelopeParser {
    /// Parses a data message into a generic `ChangeEvent` with no typed
    /// record attempt. This is the dispatcher's first pass, used only to
    /// extract `table_name` before a registration is known.
    pub fn parse(raw: &RawMessage) -> Result<ChangeEvent, Failure> {
        let envelope: Envelope = serde_json::from_str(&raw.message_body)
            .map_err(|error| Failure::Validation(format!("malformed JSON: {error}")))?;

        let event_id = envelope
            .event_id
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Failure::Validation("missing or empty eventId".to_string()))?;

        let table_name = envelope
            .table_name
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Failure::Validation("missing or empty tableName".to_string()))?
            .to_ascii_uppercase();

        let operation = envelope
            .operation
            .as_deref()
            .ok_or_else(|| Failure::Validation("missing operation".to_string()))?;
        let change_type = ChangeType::parse(operation).ok_or_else(|| {
            Failure::Validation(format!(
                "operation {operation:?} is not one of INSERT/UPDATE/DELETE"
            ))
        })?;

        let event_time = envelope
            .timestamp
            .as_deref()
            .and_then(parse_event_timestamp)
            .unwrap_or_else(|| {
                if let Some(raw_timestamp) = &envelope.timestamp {
                    warn!(
                        event_id = %event_id,
                        raw_timestamp = %raw_timestamp,
                        "unparseable event timestamp, falling back to wall-clock time"
                    );
                }
                Utc::now()
            });

        let raw_record = match envelope.record {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Ok(ChangeEvent {
            event_id,
            table_name,
            change_type,
            event_time,
            received_time: Utc::now(),
            raw_record,
            typed_record: None,
            conversation_handle: raw.conversation_handle.clone(),
            message_type_name: raw.message_type_name.clone(),
        })
    }

    /// Re-parses `raw` using `handler`'s declared record type. On
    /// conversion failure the event is still returned with `typed_record =
    /// None`; `raw_record` remains the source of truth, so a field-level
    /// schema drift never poisons an otherwise-valid change.
    pub fn parse_typed(
        raw: &RawMessage,
        handler: &dyn ChangeHandler,
    ) -> Result<ChangeEvent, Failure> {
        let mut event = Self::parse(raw)?;
        event.typed_record = handler.parse_record(&event.raw_record);
        Ok(event)
    }
}

/// Parses an ISO-8601 local date-time, tolerating both an explicit offset
/// (RFC 3339) and the offset-less "local" forms the wire format names.
fn parse_event_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }

    None
}
