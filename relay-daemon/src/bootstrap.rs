//! Assembles the `HandlerRegistry` the supervisor runs against.
//!
//! Handler registration is an explicit, caller-supplied list rather than
//! implicit discovery — a real deployment links in application-specific
//! handler crates and builds its own `Vec<HandlerRegistration>`. This
//! module's `LoggingHandler` is the zero-code default: bind a table name to
//! it via `RELAY_LOG_TABLES` and the daemon logs every change event it
//! observes for that table at `info`, which is enough to stand the relay up
//! and watch CDC traffic before any custom handler exists.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use relay_common::registry::{ChangeHandler, HandlerError, HandlerRegistration};
use relay_common::types::{ChangeEvent, ChangeType};
use tracing::info;

struct LoggingHandler;

#[async_trait]
impl ChangeHandler for LoggingHandler {
    async fn on_insert(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        info!(
            table_name = %event.table_name,
            event_id = %event.event_id,
            change_type = %event.change_type,
            "observed change event"
        );
        Ok(())
    }

    async fn on_update(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        self.on_insert(event).await
    }

    async fn on_delete(&self, event: &ChangeEvent) -> Result<(), HandlerError> {
        self.on_insert(event).await
    }

    fn record_type_name(&self) -> &'static str {
        "raw mapping (logging handler)"
    }
}

/// One `HandlerRegistration` per configured table name, all bound to the
/// built-in `LoggingHandler` and all three operations.
pub fn logging_registrations(table_names: &[String]) -> Vec<HandlerRegistration> {
    let all_ops: HashSet<ChangeType> = [ChangeType::Insert, ChangeType::Update, ChangeType::Delete]
        .into_iter()
        .collect();

    table_names
        .iter()
        .map(|table_name| {
            HandlerRegistration::new(
                table_name.clone(),
                format!("{table_name}-logging"),
                Arc::new(LoggingHandler) as Arc<dyn ChangeHandler>,
                all_ops.clone(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn one_registration_per_configured_table() {
        let registrations = logging_registrations(&["users".to_string(), "orders".to_string()]);
        let registry = relay_common::registry::HandlerRegistry::build(registrations)
            .await
            .unwrap();

        assert!(registry.lookup("USERS").is_some());
        assert!(registry.lookup("ORDERS").is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn no_configured_tables_yields_no_registrations() {
        assert!(logging_registrations(&[]).is_empty());
    }
}
