//! Axum router construction.

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::{admin, events, runs};

/// Build the complete router.
///
/// - `POST /jobs`, `GET /jobs`, `GET|PATCH /jobs/{name}`
/// - `GET|POST /jobs/{name}/runs`
/// - `GET /runs/{run_id}`, `PUT /runs/{run_id}/running`, `PUT /runs/{run_id}/complete`
/// - `GET /events/stream` and the `/events/{lineage,jobs,metrics}` presets
/// - `POST /events/pong`
/// - `/admin/events/*` and `/admin/queue/*` introspection
/// - `GET /health`
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    Router::new()
        .route("/health", get(admin::health))
        // Producer
        .route("/jobs", post(runs::register_job).get(runs::list_jobs))
        .route("/jobs/{name}", get(runs::get_job).patch(runs::update_job))
        .route("/jobs/{name}/runs", post(runs::start_run).get(runs::list_runs))
        .route("/runs/{run_id}", get(runs::get_run))
        .route("/runs/{run_id}/running", put(runs::report_running))
        .route("/runs/{run_id}/complete", put(runs::complete_run))
        // Observers
        .route("/events/stream", get(events::stream))
        .route("/events/lineage", get(events::lineage_stream))
        .route("/events/jobs", get(events::jobs_stream))
        .route("/events/metrics", get(events::metrics_stream))
        .route("/events/pong", post(events::pong))
        // Admin
        .route("/admin/events/stats", get(admin::hub_stats))
        .route("/admin/events/zombies", get(admin::zombie_stats))
        .route("/admin/events/zombies/cleanup", post(admin::force_cleanup))
        .route("/admin/events/broadcast", post(admin::broadcast))
        .route(
            "/admin/events/clients/{client_id}",
            delete(admin::disconnect_client),
        )
        .route("/admin/queue/stats", get(admin::queue_stats))
        .route("/admin/queue/dead-letters", get(admin::dead_letters))
        .route(
            "/admin/queue/dead-letters/{sequence_id}/redrive",
            post(admin::redrive),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
