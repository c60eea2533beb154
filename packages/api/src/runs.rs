//! Producer routes: job registration and run lifecycle.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;

use actors::QueuedChange;
use lineage_core::{Job, Run, RunChange, RunId, RunState};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterJobRequest {
    pub name: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateJobRequest {
    pub metadata: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartRunRequest {
    pub metadata: Value,
    pub idempotency_key: Option<String>,
}

/// Terminal state plus the change it carries.
///
/// The state is given either as `state` (`COMPLETED` / `FAILED`) or as a
/// `success` flag.
#[derive(Debug, Deserialize)]
pub struct CompleteRunRequest {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(flatten)]
    pub change: RunChange,
}

impl CompleteRunRequest {
    fn target(&self) -> Result<RunState, ApiError> {
        match (&self.state, self.success) {
            (Some(state), None) => Ok(state.parse()?),
            (None, Some(true)) => Ok(RunState::Completed),
            (None, Some(false)) => Ok(RunState::Failed),
            (Some(_), Some(_)) => Err(ApiError::BadRequest(
                "give either 'state' or 'success', not both".into(),
            )),
            (None, None) => Err(ApiError::BadRequest(
                "missing 'state' or 'success'".into(),
            )),
        }
    }
}

fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    RunId::parse(raw).map_err(|e| ApiError::BadRequest(format!("invalid run id '{}': {}", raw, e)))
}

/// `POST /jobs`
pub async fn register_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.machine.register_job(&req.name, req.metadata).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// `GET /jobs`
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.machine.list_jobs().await?))
}

/// `GET /jobs/{name}`
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.machine.get_job(&name).await?))
}

/// `PATCH /jobs/{name}`
pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<UpdateJobRequest>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.machine.update_job_metadata(&name, req.metadata).await?))
}

/// `GET /jobs/{name}/runs`
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Run>>, ApiError> {
    state.machine.get_job(&name).await?;
    Ok(Json(state.machine.list_runs_for_job(&name).await?))
}

/// `POST /jobs/{name}/runs`
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<StartRunRequest>>,
) -> Result<(StatusCode, Json<QueuedChange>), ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let queued = state
        .producer
        .start_run(&name, req.metadata, req.idempotency_key)
        .await?;
    Ok((StatusCode::CREATED, Json(queued)))
}

/// `GET /runs/{run_id}`
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Run>, ApiError> {
    let run_id = parse_run_id(&run_id)?;
    Ok(Json(state.machine.get_run(run_id).await?))
}

/// `PUT /runs/{run_id}/running`
pub async fn report_running(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    body: Option<Json<RunChange>>,
) -> Result<(StatusCode, Json<QueuedChange>), ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let change = body.map(|Json(change)| change).unwrap_or_default();
    let queued = state.producer.report_running(run_id, change).await?;
    Ok((StatusCode::ACCEPTED, Json(queued)))
}

/// `PUT /runs/{run_id}/complete`
pub async fn complete_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(req): Json<CompleteRunRequest>,
) -> Result<(StatusCode, Json<QueuedChange>), ApiError> {
    let run_id = parse_run_id(&run_id)?;
    let target = req.target()?;
    let queued = state.producer.complete_run(run_id, target, req.change).await?;
    Ok((StatusCode::ACCEPTED, Json(queued)))
}
