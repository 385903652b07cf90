//! Process-level bootstrapping: loads configuration, wires the
//! Postgres-backed `QueueBackend`, the error classifier, and the handler
//! registry into a `Supervisor`, serves the health/metrics/status HTTP
//! surface, and owns the process exit-code contract for the two
//! process-fatal `ErrorKind`s.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod bootstrap;
mod config;
mod error;
mod handlers;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::Router;
use common_metrics::setup_metrics_routes;
use envconfig::Envconfig;
use health::HealthRegistry;
use relay_common::error::{ClassifierConfig, ErrorClassifier};
use relay_common::registry::HandlerRegistry;
use relay_queue::config::PgBackendConfig;
use relay_queue::pg::PgBackend;
use relay_supervisor::{Supervisor, SupervisorConfig};
use tokio::signal;
use tracing::info;

use crate::config::Config;
use crate::error::DaemonError;
use crate::handlers::DashboardState;

common_alloc::used!();

async fn shutdown_signal() {
    // Registering a Unix signal handler only fails if the signal is
    // unsupported on the platform or the process is out of file descriptors;
    // either way there is no graceful-shutdown path left to fall back to.
    #[allow(clippy::expect_used)]
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    #[allow(clippy::expect_used)]
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = interrupt.recv() => info!("received SIGINT"),
    };
}

fn classifier_config(config: &Config) -> ClassifierConfig {
    ClassifierConfig {
        base_retry_delay: config.base_retry_delay.get(),
        max_retry_delay: config.max_retry_delay.get(),
        use_exponential_backoff: config.use_exponential_backoff,
        assertion_is_retryable: config.assertion_is_retryable,
        ..ClassifierConfig::default()
    }
}

fn supervisor_config(config: &Config) -> SupervisorConfig {
    SupervisorConfig {
        listener_threads: config.listener_threads,
        max_retries: config.max_retries,
        graceful_timeout: config.graceful_timeout.get(),
        restart_settle_pause: config.restart_settle_pause.get(),
        error_rate_threshold: config.error_rate_threshold,
        max_queue_name_length: config.max_queue_name_length,
    }
}

/// Binds the health/metrics/status listener and serves it, mirroring
/// `hook-janitor::main::listen`'s `eyre`-free `Result`-returning wrapper
/// around `axum::serve` so the error propagates through `?` instead of a
/// bare `.expect()`.
async fn listen(router: Router, bind: String) -> Result<(), DaemonError> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;

    let liveness = HealthRegistry::new("liveness");
    let supervisor_liveness = liveness
        .register("supervisor".to_string(), StdDuration::from_secs(60))
        .await;

    let backend = Arc::new(PgBackend::new(
        PgBackendConfig::new(config.database_url.clone())
            .with_poll_interval(config.poll_interval.get()),
    ));
    let classifier = Arc::new(ErrorClassifier::new(classifier_config(&config)));
    let supervisor = Supervisor::new(backend, classifier, supervisor_config(&config));

    let registrations = bootstrap::logging_registrations(&config.log_table_names());
    let registry = Arc::new(HandlerRegistry::build(registrations).await?);

    supervisor
        .start(config.queue_name.clone(), registry)
        .await?;
    supervisor_liveness.report_healthy().await;
    info!(queue_name = %config.queue_name, "relay supervisor started");

    let router = Router::new();
    let router = handlers::add_routes(
        router,
        DashboardState {
            supervisor: supervisor.clone(),
        },
    );
    let router = router.route(
        "/_liveness",
        axum::routing::get(move || std::future::ready(liveness.get_status())),
    );
    let router = setup_metrics_routes(router);
    let bind = config.bind();

    let server = tokio::spawn(listen(router, bind));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received; draining workers");
            supervisor.stop(true).await;
            info!("supervisor stopped cleanly");
            Ok(())
        }
        outcome = supervisor.wait_for_fatal_process_fault() => {
            supervisor.stop(true).await;
            error::exit_for_worker_outcome(outcome);
        }
        result = server => {
            supervisor.stop(true).await;
            match result {
                Ok(inner) => inner,
                Err(join_error) => {
                    tracing::error!(%join_error, "health/metrics/status server task panicked");
                    Ok(())
                }
            }
        }
    }
}
