//! Errors a `QueueBackend` can raise. Kept independent of any one driver so
//! `relay-common::error::Failure` can classify them without depending on
//! `sqlx`.

use relay_common::error::Failure;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error ({code:?}): {message}")]
    Database {
        code: Option<String>,
        message: String,
    },
    #[error("queue {0:?} is not enabled")]
    QueueDisabled(String),
    #[error("service broker is not enabled")]
    BrokerDisabled,
    #[error("malformed row from queue: {0}")]
    MalformedRow(String),
}

impl QueueError {
    pub fn database(error: sqlx::Error) -> Self {
        let code = error
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.to_string());
        QueueError::Database {
            code,
            message: error.to_string(),
        }
    }
}

impl QueueError {
    /// Not a `From` impl: `Failure` lives in `relay-common`, which this
    /// crate depends on, and the orphan rule forbids implementing a foreign
    /// trait for a foreign type even when one of the type parameters is
    /// local.
    pub fn into_failure(self) -> Failure {
        match self {
            QueueError::Database { code, message } => Failure::Database { code, message },
            QueueError::QueueDisabled(name) => Failure::Database {
                code: Some("42P01".to_string()),
                message: format!("queue {name:?} is not enabled"),
            },
            QueueError::BrokerDisabled => Failure::Database {
                code: Some("BROKER_DISABLED".to_string()),
                message: "service broker is not enabled".to_string(),
            },
            QueueError::MalformedRow(message) => Failure::Database {
                code: None,
                message,
            },
        }
    }
}
