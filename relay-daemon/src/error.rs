//! Daemon-level errors: everything that can go wrong before the supervisor
//! takes over, and the exit-code contract for the two process-fatal kinds
//! (`FatalProcessImmediate` → 2, `FatalProcessGraceful` → 3).

use relay_common::registry::RegistryBuildError;
use relay_supervisor::SupervisorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("invalid configuration: {0}")]
    Config(#[from] envconfig::Error),
    #[error("failed to build the handler registry: {0}")]
    Registry(#[from] RegistryBuildError),
    #[error("failed to start the supervisor: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("health/metrics/status server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// A fatal shutdown logs its cause and produces a deterministic exit code.
/// Kept as a single function so the contract lives in one place rather than
/// being duplicated at every call site.
pub fn exit_for_worker_outcome(outcome: relay_worker::WorkerOutcome) -> ! {
    use relay_worker::WorkerOutcome;

    match outcome {
        WorkerOutcome::FatalProcessImmediate => {
            tracing::error!("fatal resource-exhaustion condition observed; exiting immediately");
            std::process::exit(2);
        }
        WorkerOutcome::FatalProcessGraceful => {
            tracing::error!("fatal linkage/load condition observed; exiting after graceful stop");
            std::process::exit(3);
        }
        other => {
            tracing::error!(?other, "exit_for_worker_outcome called with a non-process-fatal outcome");
            std::process::exit(1);
        }
    }
}
