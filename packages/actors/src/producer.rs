//! Producer side of the coordinator: records run lifecycle requests and
//! queues them for the worker.
//!
//! Requests are validated against the stored run before anything is
//! enqueued, so callers see `NotFound`, `Conflict` and `InvalidTransition`
//! immediately. The run itself only changes once the worker applies the
//! queued event.

use std::sync::Arc;

use db::DurableQueue;
use lineage_core::{CoreError, CoreResult, Event, LineagePhase, Run, RunChange, RunId, RunState};
use serde::Serialize;
use serde_json::Value;

use crate::runs::RunStateMachine;

/// A run together with the queue sequence of the event recorded for it.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedChange {
    pub run: Run,
    pub sequence_id: u64,
}

pub struct RunProducer {
    machine: Arc<RunStateMachine>,
    queue: Arc<DurableQueue>,
}

impl RunProducer {
    pub fn new(machine: Arc<RunStateMachine>, queue: Arc<DurableQueue>) -> Self {
        Self { machine, queue }
    }

    /// Create a PENDING run and queue its START event.
    ///
    /// If the event cannot be queued the run is removed again.
    pub async fn start_run(
        &self,
        job_name: &str,
        metadata: Value,
        idempotency_key: Option<String>,
    ) -> CoreResult<QueuedChange> {
        let run = self
            .machine
            .start_run(job_name, metadata, idempotency_key)
            .await?;
        let event = Event::lineage(run.run_id, &run.job_name, LineagePhase::Start, RunChange::new());
        let sequence_id = match self.queue.enqueue(&event).await {
            Ok(sequence_id) => sequence_id,
            Err(e) => {
                if let Err(discard) = self.machine.discard_run(&run).await {
                    tracing::warn!(
                        run_id = %run.run_id,
                        error = %discard,
                        "Failed to discard run after enqueue error"
                    );
                }
                return Err(e.into());
            }
        };

        Ok(QueuedChange { run, sequence_id })
    }

    /// Queue a RUNNING heartbeat for a run.
    pub async fn report_running(&self, run_id: RunId, change: RunChange) -> CoreResult<QueuedChange> {
        self.enqueue_change(run_id, RunState::Running, LineagePhase::Running, change)
            .await
    }

    /// Queue the terminal state of a run.
    pub async fn complete_run(
        &self,
        run_id: RunId,
        state: RunState,
        change: RunChange,
    ) -> CoreResult<QueuedChange> {
        let phase = match state {
            RunState::Completed => LineagePhase::Complete,
            RunState::Failed => LineagePhase::Fail,
            other => {
                return Err(CoreError::InvalidTransition(format!(
                    "a run completes as COMPLETED or FAILED, not {}",
                    other
                )));
            }
        };
        self.enqueue_change(run_id, state, phase, change).await
    }

    async fn enqueue_change(
        &self,
        run_id: RunId,
        state: RunState,
        phase: LineagePhase,
        change: RunChange,
    ) -> CoreResult<QueuedChange> {
        let checked = self
            .machine
            .validate_transition(run_id, state, &change)
            .await?;
        let event = Event::lineage(run_id, &checked.run.job_name, phase, change);
        let sequence_id = self.queue.enqueue(&event).await?;

        tracing::debug!("Queued {} for run {} at {}", phase.as_str(), run_id, sequence_id);
        Ok(QueuedChange {
            run: checked.run,
            sequence_id,
        })
    }
}
