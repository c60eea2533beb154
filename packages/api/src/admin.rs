//! Admin introspection routes for the hub and the durable queue.

use std::collections::HashSet;
use std::sync::Arc;

use actors::hub::{CleanupReport, HubStats, ZombieStats};
use actors::{PublishOutcome, WorkerStats, fetch_worker_stats};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use lineage_core::{DeadLetter, Event, EventBody, QueueStats};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::events::parse_client_id;
use crate::state::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;

/// `GET /admin/events/stats`
pub async fn hub_stats(State(state): State<Arc<AppState>>) -> Json<HubStats> {
    Json(state.hub.stats())
}

/// `GET /admin/events/zombies`
pub async fn zombie_stats(State(state): State<Arc<AppState>>) -> Json<ZombieStats> {
    Json(state.hub.zombie_stats())
}

/// `POST /admin/events/zombies/cleanup`
pub async fn force_cleanup(State(state): State<Arc<AppState>>) -> Json<CleanupReport> {
    Json(state.hub.force_cleanup())
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub event: EventBody,
    /// Restrict delivery to these clients.
    #[serde(default)]
    pub targets: Option<Vec<String>>,
}

/// `POST /admin/events/broadcast`
pub async fn broadcast(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BroadcastRequest>,
) -> Result<Json<PublishOutcome>, ApiError> {
    if req.event.kind().is_control() {
        return Err(ApiError::BadRequest(format!(
            "{} events are generated by the hub",
            req.event.kind()
        )));
    }

    let event = Event::new(req.event);
    let outcome = match req.targets {
        Some(targets) => {
            let targets = targets
                .iter()
                .map(|raw| parse_client_id(raw))
                .collect::<Result<HashSet<_>, _>>()?;
            state.hub.publish_to(event, Some(&targets))
        }
        None => state.hub.publish(event),
    };

    tracing::info!(
        sequence = outcome.sequence_id,
        delivered = outcome.delivered,
        "Broadcast admin event"
    );
    Ok(Json(outcome))
}

/// `DELETE /admin/events/clients/{client_id}`
pub async fn disconnect_client(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let client_id = parse_client_id(&client_id)?;
    state.hub.disconnect(client_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct QueueOverview {
    pub queue: QueueStats,
    pub worker: Option<WorkerStats>,
}

/// `GET /admin/queue/stats`
pub async fn queue_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<QueueOverview>, ApiError> {
    let queue = state.queue.stats().await?;
    let worker = match &state.worker {
        Some(worker) => Some(fetch_worker_stats(worker).await?),
        None => None,
    };
    Ok(Json(QueueOverview { queue, worker }))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// `GET /admin/queue/dead-letters`
pub async fn dead_letters(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT);
    Ok(Json(state.queue.list_dead_letters(limit).await?))
}

/// `POST /admin/queue/dead-letters/{sequence_id}/redrive`
pub async fn redrive(
    State(state): State<Arc<AppState>>,
    Path(sequence_id): Path<u64>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let new_sequence_id = state.queue.redrive(sequence_id).await?;
    tracing::info!("Redrove dead letter {} as {}", sequence_id, new_sequence_id);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "redriven": sequence_id,
            "sequence_id": new_sequence_id,
        })),
    ))
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "clients": state.hub.client_count(),
        "queue": state.queue.name(),
    }))
}
