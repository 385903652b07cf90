//! `HandlerRegistry`: the read-only, boot-time-built lookup from table name
//! to the callback capability a handler registers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::types::{ChangeEvent, ChangeType};

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The capability a table's registered handler must provide. Every method
/// has a default so a handler only needs to implement the operations it
/// actually supports; a missing operation means "unsupported" for dispatch
/// purposes (see `HandlerRegistration::supports`).
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn on_insert(&self, _event: &ChangeEvent) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_update(&self, _event: &ChangeEvent) -> Result<(), HandlerError> {
        Ok(())
    }

    async fn on_delete(&self, _event: &ChangeEvent) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called once, at registry build, after `validate_setup` succeeds.
    async fn on_registered(&self, _table_name: &str) {}

    /// Called once, at registry build. Raising removes the registration
    /// rather than failing the whole build.
    async fn validate_setup(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Attempts to parse `raw_record` into this handler's declared record
    /// type. The default handler declares no specific type ("raw mapping")
    /// and never produces a typed record.
    fn parse_record(&self, _raw_record: &Map<String, Value>) -> Option<Value> {
        None
    }

    /// An identifier for the declared record type, used only for telemetry
    /// and the `HandlerRegistration::record_type` field.
    fn record_type_name(&self) -> &'static str {
        "raw mapping"
    }
}

/// A single table → handler binding, built once and immutable thereafter.
pub struct HandlerRegistration {
    pub table_name: String,
    pub handler: Arc<dyn ChangeHandler>,
    pub supported_operations: HashSet<ChangeType>,
    pub enabled: bool,
    pub registration_name: String,
}

impl HandlerRegistration {
    pub fn new(
        table_name: impl Into<String>,
        registration_name: impl Into<String>,
        handler: Arc<dyn ChangeHandler>,
        supported_operations: HashSet<ChangeType>,
    ) -> Self {
        Self {
            table_name: table_name.into().to_ascii_uppercase(),
            handler,
            supported_operations,
            enabled: true,
            registration_name: registration_name.into(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn supports(&self, change_type: ChangeType) -> bool {
        self.enabled && self.supported_operations.contains(&change_type)
    }

    pub fn record_type(&self) -> &'static str {
        self.handler.record_type_name()
    }
}

#[derive(Debug, Error)]
pub enum RegistryBuildError {
    #[error("duplicate registration for table {0}: table names must be unique")]
    DuplicateTable(String),
}

/// Boot-time-built, read-only table → registration lookup. Duplicate-table
/// registrations are rejected outright; a handler whose `validate_setup`
/// raises is dropped with a warning rather than failing the whole build.
pub struct HandlerRegistry {
    by_table: HashMap<String, HandlerRegistration>,
}

impl HandlerRegistry {
    /// Builds the registry from a caller-supplied list of registrations.
    /// Calls `validate_setup` and, on success, `on_registered` for each
    /// handler exactly once.
    pub async fn build(
        registrations: Vec<HandlerRegistration>,
    ) -> Result<Self, RegistryBuildError> {
        let mut seen = HashSet::new();
        for registration in &registrations {
            if !seen.insert(registration.table_name.clone()) {
                return Err(RegistryBuildError::DuplicateTable(
                    registration.table_name.clone(),
                ));
            }
        }

        let mut by_table = HashMap::new();
        for registration in registrations {
            match registration.handler.validate_setup().await {
                Ok(()) => {
                    registration
                        .handler
                        .on_registered(&registration.table_name)
                        .await;
                    by_table.insert(registration.table_name.clone(), registration);
                }
                Err(error) => {
                    warn!(
                        table_name = %registration.table_name,
                        registration_name = %registration.registration_name,
                        %error,
                        "handler validation failed; registration dropped"
                    );
                }
            }
        }

        Ok(Self { by_table })
    }

    /// Looks up the registration for an already-canonicalized (upper-case)
    /// table name.
    pub fn lookup(&self, table_name: &str) -> Option<&HandlerRegistration> {
        self.by_table.get(table_name)
    }

    pub fn len(&self) -> usize {
        self.by_table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_table.is_empty()
    }
}
