//! Connection parameters for the reference Postgres backend. A worker owns
//! its connection for its entire lifetime, so this is a recipe for opening
//! one connection, not a pool.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PgBackendConfig {
    pub database_url: String,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl PgBackendConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            poll_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
