//! The dispatcher: parses a raw message, routes data messages to a
//! registered handler, and reduces system messages to a plain acknowledge.
//! Produces a `DispatchOutcome`; the worker decides how to conclude the
//! transaction.

use relay_common::envelope::EnvelopeParser;
use relay_common::error::Failure;
use relay_common::registry::HandlerRegistry;
use relay_common::types::{ChangeType, RawMessage};
use tracing::debug;

/// What the worker should do with the open transaction after `dispatch`
/// returns.
pub enum DispatchOutcome {
    /// `endConversation(reason)` then `commit`.
    Acknowledge(String),
    /// Consult the classifier; the worker owns the retry-vs-poison decision
    /// because only it knows the conversation's current `RetryState`.
    Failure(Failure),
}

pub struct Dispatcher;

impl Dispatcher {
    /// Per-message entry point. System messages never reach a handler.
    pub async fn dispatch(raw: &RawMessage, registry: &HandlerRegistry) -> DispatchOutcome {
        if let Some((_, reason)) = raw.system_message_type() {
            return DispatchOutcome::Acknowledge(reason);
        }

        let generic_event = match EnvelopeParser::parse(raw) {
            Ok(event) => event,
            Err(failure) => return DispatchOutcome::Failure(failure),
        };

        let registration = match registry.lookup(&generic_event.table_name) {
            Some(registration) => registration,
            None => {
                debug!(
                    table_name = %generic_event.table_name,
                    "no registration for table; acknowledging without dispatch"
                );
                return DispatchOutcome::Acknowledge("unsubscribed table".to_string());
            }
        };

        if !registration.supports(generic_event.change_type) {
            debug!(
                table_name = %generic_event.table_name,
                change_type = %generic_event.change_type,
                "registration does not support this operation; acknowledging"
            );
            return DispatchOutcome::Acknowledge("unsupported operation".to_string());
        }

        let event = match EnvelopeParser::parse_typed(raw, registration.handler.as_ref()) {
            Ok(event) => event,
            Err(failure) => return DispatchOutcome::Failure(failure),
        };

        let result = match event.change_type {
            ChangeType::Insert => registration.handler.on_insert(&event).await,
            ChangeType::Update => registration.handler.on_update(&event).await,
            ChangeType::Delete => registration.handler.on_delete(&event).await,
        };

        match result {
            Ok(()) => DispatchOutcome::Acknowledge("processed".to_string()),
            Err(error) => DispatchOutcome::Failure(Failure::Handler(error.0)),
        }
    }
}
