//! Queue worker: a supervisor actor owning a pool of pollers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lineage_core::{Event, EventBody};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use serde::Serialize;

use crate::backoff::BackoffPolicy;
use crate::hub::EventHub;
use crate::messages::{ActorError, PollerMessage, WorkerMessage};
use crate::processor::{EventProcessor, ProcessOutcome};

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of pollers.
    pub concurrency: usize,
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// How often a QueueStatus event is published.
    pub metrics_interval: Duration,
    pub backoff: BackoffPolicy,
    /// How long shutdown waits for each poller's in-flight batch.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            metrics_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Processing counters since start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub pollers: usize,
    pub processed: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub forwarded: u64,
    pub rejected: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Messages whose settlement failed and will be redelivered.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    applied: AtomicU64,
    unchanged: AtomicU64,
    forwarded: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &ProcessOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            ProcessOutcome::Applied(_) => &self.applied,
            ProcessOutcome::Unchanged => &self.unchanged,
            ProcessOutcome::Forwarded => &self.forwarded,
            ProcessOutcome::Rejected => &self.rejected,
            ProcessOutcome::Retried(_) => &self.retried,
            ProcessOutcome::DeadLettered => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, pollers: usize) -> WorkerStats {
        WorkerStats {
            pollers,
            processed: self.processed.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Arguments for spawning a poller.
#[derive(Clone)]
pub struct PollerArgs {
    pub poller_id: usize,
    pub processor: Arc<EventProcessor>,
    pub batch_size: usize,
    pub poll_interval: Duration,
    counters: Arc<Counters>,
}

/// Leases batches from the queue and processes them in order.
pub struct PollerActor;

impl Actor for PollerActor {
    type Msg = PollerMessage;
    type State = PollerArgs;
    type Arguments = PollerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!("Starting poller {}", args.poller_id);

        let myself_clone = myself.clone();
        let interval = args.poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if myself_clone.send_message(PollerMessage::Poll).is_err() {
                    break;
                }
            }
        });

        Ok(args)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PollerMessage::Poll => {
                let queue = state.processor.queue();
                let lease = queue.config().visibility_timeout();
                let leased = match queue.dequeue(state.batch_size, lease).await {
                    Ok(leased) => leased,
                    Err(e) => {
                        tracing::warn!("Poller {} failed to dequeue: {}", state.poller_id, e);
                        return Ok(());
                    }
                };

                let full_batch = leased.len() == state.batch_size;
                for message in leased {
                    let sequence_id = message.handle.sequence_id;
                    match state.processor.process(message).await {
                        Ok(outcome) => state.counters.record(&outcome),
                        Err(e) => {
                            state.counters.failed.fetch_add(1, Ordering::Relaxed);
                            tracing::error!(
                                "Poller {} failed to settle message {}: {}",
                                state.poller_id,
                                sequence_id,
                                e
                            );
                        }
                    }
                }

                // Keep draining while the queue has a backlog.
                if full_batch {
                    let _ = myself.send_message(PollerMessage::Poll);
                }
            }

        }

        Ok(())
    }
}

/// State for the worker supervisor.
pub struct WorkerState {
    config: WorkerConfig,
    processor: Arc<EventProcessor>,
    hub: Arc<EventHub>,
    counters: Arc<Counters>,
    pollers: Vec<ActorRef<PollerMessage>>,
    next_poller_id: usize,
}

impl WorkerState {
    fn poller_args(&mut self) -> PollerArgs {
        self.next_poller_id += 1;
        PollerArgs {
            poller_id: self.next_poller_id,
            processor: self.processor.clone(),
            batch_size: self.config.batch_size,
            poll_interval: self.config.poll_interval,
            counters: self.counters.clone(),
        }
    }

    async fn spawn_poller(
        &mut self,
        supervisor: &ActorRef<WorkerMessage>,
    ) -> Result<(), ActorProcessingErr> {
        let args = self.poller_args();
        let (poller, _handle) =
            Actor::spawn_linked(None, PollerActor, args, supervisor.get_cell())
                .await
                .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn poller: {}", e)))?;
        self.pollers.push(poller);
        Ok(())
    }
}

/// Arguments for [`start_worker`].
pub struct WorkerArgs {
    pub config: WorkerConfig,
    pub processor: Arc<EventProcessor>,
    pub hub: Arc<EventHub>,
}

/// Supervises the pollers and publishes queue status samples.
pub struct WorkerSupervisor;

impl Actor for WorkerSupervisor {
    type Msg = WorkerMessage;
    type State = WorkerState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            queue = args.processor.queue().name(),
            concurrency = args.config.concurrency,
            "Starting queue worker"
        );

        let metrics_interval = args.config.metrics_interval;
        let mut state = WorkerState {
            config: args.config,
            processor: args.processor,
            hub: args.hub,
            counters: Arc::new(Counters::default()),
            pollers: Vec::new(),
            next_poller_id: 0,
        };

        for _ in 0..state.config.concurrency.max(1) {
            state.spawn_poller(&myself).await?;
        }

        let myself_clone = myself.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(metrics_interval);
            loop {
                interval.tick().await;
                if myself_clone.send_message(WorkerMessage::Metrics).is_err() {
                    break;
                }
            }
        });

        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Metrics => match state.processor.queue().stats().await {
                Ok(stats) => {
                    state.hub.publish(Event::new(EventBody::QueueStatus {
                        queue_name: stats.queue_name,
                        depth: stats.depth,
                        in_flight: stats.in_flight,
                        dead_letter_depth: stats.dead_letter_depth,
                        throughput_per_min: stats.throughput_per_min,
                    }));
                }
                Err(e) => tracing::warn!("Failed to sample queue stats: {}", e),
            },

            WorkerMessage::GetStats { reply } => {
                let _ = reply.send(state.counters.snapshot(state.pollers.len()));
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down queue worker");
                for poller in state.pollers.drain(..) {
                    if let Err(e) = poller
                        .stop_and_wait(None, Some(state.config.shutdown_timeout))
                        .await
                    {
                        tracing::warn!("Poller did not stop cleanly: {}", e);
                    }
                }
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let SupervisionEvent::ActorFailed(cell, err) = message {
            tracing::error!("Poller {:?} failed: {}", cell.get_id(), err);
            state.pollers.retain(|p| p.get_id() != cell.get_id());
            state.spawn_poller(&myself).await?;
        }
        Ok(())
    }
}

/// Start a worker pool over `processor`.
pub async fn start_worker(
    config: WorkerConfig,
    processor: Arc<EventProcessor>,
    hub: Arc<EventHub>,
) -> Result<(ActorRef<WorkerMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    Actor::spawn(
        None,
        WorkerSupervisor,
        WorkerArgs {
            config,
            processor,
            hub,
        },
    )
    .await
}

/// Ask a running worker for its counters.
pub async fn fetch_worker_stats(
    worker: &ActorRef<WorkerMessage>,
) -> Result<WorkerStats, ActorError> {
    let result = ractor::rpc::call(
        worker,
        |reply| WorkerMessage::GetStats { reply },
        Some(Duration::from_secs(5)),
    )
    .await
    .map_err(|e| ActorError::Actor(e.to_string()))?;

    match result {
        ractor::rpc::CallResult::Success(stats) => Ok(stats),
        ractor::rpc::CallResult::Timeout => Err(ActorError::Timeout),
        ractor::rpc::CallResult::SenderError => {
            Err(ActorError::Actor("worker is not running".into()))
        }
    }
}
