#![allow(dead_code)]

use std::sync::Arc;

use actors::{EventHub, EventProcessor, RunProducer, RunStateMachine};
use api::AppState;
use axum::body::Body;
use db::{DbConfig, DbError, DurableQueue};
use lineage_core::QueueConfig;
use serde_json::Value;

/// App state over an in-memory database, with no worker running.
pub async fn setup_state() -> Result<Arc<AppState>, DbError> {
    let db = db::init(&DbConfig::memory()).await?;
    let machine = Arc::new(RunStateMachine::new(db.clone()));
    let queue = Arc::new(DurableQueue::new(db, QueueConfig::default()));
    let hub = Arc::new(EventHub::default());
    let producer = Arc::new(RunProducer::new(machine.clone(), queue.clone()));

    Ok(Arc::new(AppState::new(machine, producer, queue, hub)))
}

/// Process everything currently queued, as the worker would.
pub async fn drain(state: &AppState) -> Result<usize, Box<dyn std::error::Error>> {
    let processor =
        EventProcessor::new(state.queue.clone(), state.machine.clone(), state.hub.clone());
    let leased = state.queue.dequeue(100, std::time::Duration::from_secs(30)).await?;
    let count = leased.len();
    for message in leased {
        processor.process(message).await?;
    }
    Ok(count)
}

pub async fn body_to_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
