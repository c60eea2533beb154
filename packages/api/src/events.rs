//! Observer event streams over Server-Sent Events.
//!
//! Each connection registers with the hub and gets its own writer task,
//! bridged to the response body through a small channel. The client id is
//! returned in the `x-client-id` header; clients answer pings with
//! `POST /events/pong`.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use actors::ClientId;
use actors::hub::{self, FrameSink, SinkError, SinkFuture};
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use lineage_core::{EventKind, SseFrame};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::ApiError;
use crate::state::AppState;

const CLIENT_ID_HEADER: HeaderName = HeaderName::from_static("x-client-id");

/// Frames buffered between the writer task and the response body.
const BRIDGE_CAPACITY: usize = 8;

/// Writes frames into the channel backing an SSE response.
pub struct ChannelSink(pub mpsc::Sender<Result<Event, Infallible>>);

impl FrameSink for ChannelSink {
    fn send(&mut self, frame: SseFrame) -> SinkFuture<'_> {
        Box::pin(async move {
            let mut event = Event::default().event(frame.event).data(frame.data);
            if let Some(id) = frame.id {
                event = event.id(id);
            }
            self.0.send(Ok(event)).await.map_err(|_| SinkError::Closed)
        })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated event kinds; empty means all.
    pub events: Option<String>,
}

fn parse_kinds(raw: Option<&str>) -> Result<HashSet<EventKind>, ApiError> {
    let Some(raw) = raw else {
        return Ok(HashSet::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<EventKind>().map_err(ApiError::from))
        .collect()
}

fn open_stream(state: &AppState, kinds: HashSet<EventKind>) -> Response {
    let stream = state.hub.register(kinds);
    let client_id = stream.client_id;
    let (tx, rx) = mpsc::channel(BRIDGE_CAPACITY);

    let hub = state.hub.clone();
    tokio::spawn(async move {
        let reason = hub::drive(hub, stream, ChannelSink(tx)).await;
        tracing::debug!(client = %client_id, ?reason, "Event stream closed");
    });

    let sse = Sse::new(ReceiverStream::new(rx));
    match HeaderValue::from_str(&client_id.to_string()) {
        Ok(value) => ([(CLIENT_ID_HEADER, value)], sse).into_response(),
        Err(_) => sse.into_response(),
    }
}

/// `GET /events/stream?events=a,b`
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let kinds = parse_kinds(query.events.as_deref())?;
    Ok(open_stream(&state, kinds))
}

/// `GET /events/lineage`
pub async fn lineage_stream(State(state): State<Arc<AppState>>) -> Response {
    open_stream(
        &state,
        HashSet::from([EventKind::LineageEvent, EventKind::Error]),
    )
}

/// `GET /events/jobs`
pub async fn jobs_stream(State(state): State<Arc<AppState>>) -> Response {
    open_stream(&state, HashSet::from([EventKind::JobStatus, EventKind::Error]))
}

/// `GET /events/metrics`
pub async fn metrics_stream(State(state): State<Arc<AppState>>) -> Response {
    open_stream(
        &state,
        HashSet::from([EventKind::QueueStatus, EventKind::SystemMetric]),
    )
}

#[derive(Debug, Deserialize)]
pub struct PongRequest {
    pub client_id: String,
}

pub(crate) fn parse_client_id(raw: &str) -> Result<ClientId, ApiError> {
    ClientId::parse(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid client id '{}': {}", raw, e)))
}

/// `POST /events/pong`
pub async fn pong(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PongRequest>,
) -> Result<StatusCode, ApiError> {
    let client_id = parse_client_id(&req.client_id)?;
    state.hub.pong(client_id)?;
    Ok(StatusCode::NO_CONTENT)
}
