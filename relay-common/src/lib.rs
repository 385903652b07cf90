//! Shared types, error classification, retry bookkeeping, envelope parsing,
//! the handler registry, and telemetry primitives used by every relay
//! component (`relay-queue`, `relay-worker`, `relay-supervisor`).

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod envelope;
pub mod error;
pub mod registry;
pub mod retry;
pub mod telemetry;
pub mod types;

pub use envelope::EnvelopeParser;
pub use error::{ClassifierConfig, ErrorClassifier, ErrorKind, Failure};
pub use registry::{ChangeHandler, HandlerError, HandlerRegistration, HandlerRegistry, RegistryBuildError};
pub use retry::{RetryLedger, RetryState};
pub use telemetry::{AggregateSnapshot, ErrorLogEntry, ErrorRing, WorkerSnapshot, WorkerTelemetry};
pub use types::{ChangeEvent, ChangeType, ConversationHandle, RawMessage, SystemMessageType};
