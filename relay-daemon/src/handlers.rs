//! The read-only telemetry HTTP surface: a JSON status endpoint over
//! supervisor and worker telemetry, without a dashboard, templates, or JS
//! peripheral.
//!
//! Every handler only reads supervisor/telemetry state; none of them can
//! affect worker processing, so a slow or stuck HTTP client never blocks
//! worker progress.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use relay_queue::backend::QueueBackend;
use relay_supervisor::Supervisor;
use serde::Serialize;

#[derive(Clone)]
pub struct DashboardState<B: QueueBackend> {
    pub supervisor: Arc<Supervisor<B>>,
}

#[derive(Serialize)]
struct WorkerStatusDto {
    worker_id: u64,
    started_at: DateTime<Utc>,
    messages_processed: u64,
    errors_encountered: u64,
    messages_per_second: f64,
    error_rate: f64,
    has_recent_activity: bool,
    running: bool,
}

#[derive(Serialize)]
struct AggregateStatusDto {
    active_count: usize,
    configured_count: usize,
    total_messages_processed: u64,
    total_errors_encountered: u64,
    average_messages_per_second: f64,
    average_error_rate: f64,
    fully_operational: bool,
}

#[derive(Serialize)]
struct ErrorEntryDto {
    at: DateTime<Utc>,
    kind: String,
    worker_id: Option<u64>,
    conversation_handle: Option<String>,
    message: String,
}

#[derive(Serialize)]
struct StatusResponse {
    healthy: bool,
    retry_ledger_size: usize,
    aggregate: AggregateStatusDto,
    workers: Vec<WorkerStatusDto>,
    recent_errors: Vec<ErrorEntryDto>,
}

async fn status<B: QueueBackend>(State(state): State<DashboardState<B>>) -> Json<StatusResponse> {
    let supervisor = &state.supervisor;
    let aggregate = supervisor.aggregate_snapshot();

    let workers = supervisor
        .worker_contexts()
        .into_iter()
        .map(|context| WorkerStatusDto {
            worker_id: context.worker_id,
            started_at: context.started_at,
            messages_processed: context.telemetry.messages_processed,
            errors_encountered: context.telemetry.errors_encountered,
            messages_per_second: context.telemetry.messages_per_second(),
            error_rate: context.telemetry.error_rate(),
            has_recent_activity: context.telemetry.has_recent_activity(),
            running: context.telemetry.running,
        })
        .collect();

    let recent_errors = supervisor
        .error_ring()
        .snapshot()
        .into_iter()
        .map(|entry| ErrorEntryDto {
            at: entry.at,
            kind: format!("{:?}", entry.kind),
            worker_id: entry.worker_id,
            conversation_handle: entry.conversation_handle,
            message: entry.message,
        })
        .collect();

    Json(StatusResponse {
        healthy: supervisor.is_healthy(),
        retry_ledger_size: supervisor.ledger().size(),
        aggregate: AggregateStatusDto {
            active_count: aggregate.active_count,
            configured_count: aggregate.configured_count,
            total_messages_processed: aggregate.total_messages_processed,
            total_errors_encountered: aggregate.total_errors_encountered,
            average_messages_per_second: aggregate.average_messages_per_second,
            average_error_rate: aggregate.average_error_rate,
            fully_operational: aggregate.fully_operational,
        },
        workers,
        recent_errors,
    })
}

/// Mounts the read-only `/status` route onto `router`. Kept as a free
/// function (not a method on `DashboardState`) so `main.rs` can layer it
/// alongside `common_metrics::setup_metrics_routes` the same way
/// `hook-api::handlers::add_routes` composes onto a base `Router`.
pub fn add_routes<B: QueueBackend>(router: Router, state: DashboardState<B>) -> Router {
    router
        .route("/status", get(status::<B>))
        .with_state(state)
}
