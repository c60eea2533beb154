//! Shared application state for the HTTP handlers.

use std::sync::Arc;

use actors::{ActorRef, Coordinator, EventHub, RunProducer, RunStateMachine, WorkerMessage};
use db::DurableQueue;

/// Handles into the running coordinator.
pub struct AppState {
    pub machine: Arc<RunStateMachine>,
    pub producer: Arc<RunProducer>,
    pub queue: Arc<DurableQueue>,
    pub hub: Arc<EventHub>,
    /// Absent when the worker runs elsewhere.
    pub worker: Option<ActorRef<WorkerMessage>>,
}

impl AppState {
    pub fn new(
        machine: Arc<RunStateMachine>,
        producer: Arc<RunProducer>,
        queue: Arc<DurableQueue>,
        hub: Arc<EventHub>,
    ) -> Self {
        Self {
            machine,
            producer,
            queue,
            hub,
            worker: None,
        }
    }

    pub fn with_worker(mut self, worker: ActorRef<WorkerMessage>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn from_coordinator(coordinator: &Coordinator) -> Self {
        Self::new(
            coordinator.machine.clone(),
            coordinator.producer.clone(),
            coordinator.queue.clone(),
            coordinator.hub.clone(),
        )
        .with_worker(coordinator.worker().clone())
    }
}
