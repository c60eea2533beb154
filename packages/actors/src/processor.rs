//! Processing of a single leased queue message.

use std::sync::Arc;
use std::time::Duration;

use db::{DurableQueue, LeaseHandle, LeasedMessage, NackOutcome};
use lineage_core::{
    CoreError, CoreResult, Event, EventBody, LineagePhase, Run, RunState, TransitionOutcome,
};
use serde_json::{Value, json};

use crate::backoff::BackoffPolicy;
use crate::collector::{LineageCollector, NoopCollector, OpenLineageEvent};
use crate::hub::EventHub;
use crate::runs::RunStateMachine;

/// What happened to a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The run moved to this state.
    Applied(RunState),
    /// The run was already in the requested state.
    Unchanged,
    /// A non-lineage event was passed to observers.
    Forwarded,
    /// Acked without effect.
    Rejected,
    /// Released for another attempt after the delay.
    Retried(Duration),
    DeadLettered,
}

/// Applies queued lineage events to runs and fans the results out.
pub struct EventProcessor {
    queue: Arc<DurableQueue>,
    machine: Arc<RunStateMachine>,
    hub: Arc<EventHub>,
    collector: Arc<dyn LineageCollector>,
    backoff: BackoffPolicy,
    namespace: String,
    producer: String,
}

impl EventProcessor {
    pub fn new(queue: Arc<DurableQueue>, machine: Arc<RunStateMachine>, hub: Arc<EventHub>) -> Self {
        Self {
            queue,
            machine,
            hub,
            collector: Arc::new(NoopCollector),
            backoff: BackoffPolicy::default(),
            namespace: "default".to_string(),
            producer: concat!("lineage-coordinator/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    pub fn with_collector(mut self, collector: Arc<dyn LineageCollector>) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Namespace for OpenLineage job names.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    /// Settle one message: ack, nack or dead-letter it.
    ///
    /// Errors are queue failures while settling; the lease then expires and
    /// the message is redelivered.
    pub async fn process(&self, message: LeasedMessage) -> CoreResult<ProcessOutcome> {
        let handle = message.handle.clone();

        let event = match message.decode() {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(sequence = handle.sequence_id, "Malformed queue payload: {}", e);
                self.queue.dead_letter(&handle, &e.to_string()).await?;
                self.publish_error(&e, self.message_details(&handle));
                return Ok(ProcessOutcome::DeadLettered);
            }
        };

        let EventBody::LineageEvent {
            run_id,
            job_name,
            phase,
            payload,
        } = &event.body
        else {
            tracing::debug!("Forwarding {}", event.body.description());
            self.hub.publish(event);
            self.queue.ack(&handle).await?;
            return Ok(ProcessOutcome::Forwarded);
        };

        let next = phase.target_state();
        let details = json!({
            "run_id": run_id,
            "job_name": job_name,
            "phase": phase,
            "sequence_id": handle.sequence_id,
        });

        match self.machine.apply_transition(*run_id, next, payload).await {
            Ok(applied) => {
                let outcome = match applied.outcome {
                    TransitionOutcome::Applied => {
                        self.announce(&applied.run, *phase, &event).await;
                        ProcessOutcome::Applied(applied.run.state)
                    }
                    TransitionOutcome::NoOp => ProcessOutcome::Unchanged,
                };
                self.queue.ack(&handle).await?;
                Ok(outcome)
            }

            Err(e) if e.is_retryable() => self.retry(&handle, e, details).await,

            // A late START or RUNNING for a run that already finished.
            Err(CoreError::InvalidTransition(_)) if next == RunState::Running => {
                tracing::debug!("Ignoring stale {} for run {}", phase.as_str(), run_id);
                self.queue.ack(&handle).await?;
                Ok(ProcessOutcome::Rejected)
            }

            Err(e) if e.is_validation() => {
                tracing::warn!("Rejected {}: {}", event.body.description(), e);
                self.queue.ack(&handle).await?;
                self.publish_error(&e, details);
                Ok(ProcessOutcome::Rejected)
            }

            Err(e) => {
                tracing::error!("Failed to apply {}: {}", event.body.description(), e);
                self.queue.dead_letter(&handle, &e.to_string()).await?;
                self.publish_error(&e, details);
                Ok(ProcessOutcome::DeadLettered)
            }
        }
    }

    async fn retry(
        &self,
        handle: &LeaseHandle,
        error: CoreError,
        details: Value,
    ) -> CoreResult<ProcessOutcome> {
        let delay = self.backoff.next(handle.attempt.saturating_sub(1));
        let outcome = self
            .queue
            .nack_with_error(handle, delay, Some(error.to_string()))
            .await?;

        match outcome {
            NackOutcome::Requeued => {
                tracing::warn!(
                    sequence = handle.sequence_id,
                    attempt = handle.attempt,
                    "Transient failure, retrying in {:?}: {}",
                    delay,
                    error
                );
                Ok(ProcessOutcome::Retried(delay))
            }
            NackOutcome::DeadLettered => {
                self.publish_error(&error, details);
                Ok(ProcessOutcome::DeadLettered)
            }
        }
    }

    /// Forward an applied transition to the collector and observers.
    async fn announce(&self, run: &Run, phase: LineagePhase, event: &Event) {
        let lineage = OpenLineageEvent::from_run(run, phase, &self.namespace, &self.producer);
        if let Err(e) = self.collector.emit(lineage).await {
            tracing::warn!(
                collector = self.collector.name(),
                "Failed to forward run {} to collector: {}",
                run.run_id,
                e
            );
        }

        self.hub.publish(event.clone());
        self.hub.publish(Event::new(EventBody::JobStatus {
            job_name: run.job_name.clone(),
            run_id: Some(run.run_id),
            status: run.state.as_str().to_string(),
            progress: run.state.is_terminal().then_some(1.0),
        }));
    }

    fn publish_error(&self, error: &CoreError, details: Value) {
        self.hub.publish(Event::new(EventBody::error(error, details)));
    }

    fn message_details(&self, handle: &LeaseHandle) -> Value {
        json!({
            "queue": self.queue.name(),
            "sequence_id": handle.sequence_id,
            "attempt": handle.attempt,
        })
    }
}
