//! The external collaborator boundary: `QueueBackend` plus a Postgres
//! reference implementation and an in-memory fake for tests.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod backend;
pub mod config;
pub mod error;
pub mod fake;
pub mod pg;

pub use backend::QueueBackend;
pub use config::PgBackendConfig;
pub use error::QueueError;
pub use fake::FakeQueue;
pub use pg::PgBackend;
