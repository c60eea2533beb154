//! Wiring of the whole coordinator: storage, state machine, queue, hub and
//! the actors that drive them.

use std::sync::Arc;

use db::{Database, DbConfig, DurableQueue};
use lineage_core::QueueConfig;
use ractor::ActorRef;
use tokio::task::JoinHandle;

use crate::collector::{LineageCollector, NoopCollector};
use crate::hub::{EventHub, HubConfig, start_hub_monitor};
use crate::messages::{ActorError, MonitorMessage, WorkerMessage};
use crate::processor::EventProcessor;
use crate::producer::RunProducer;
use crate::runs::RunStateMachine;
use crate::worker::{WorkerConfig, WorkerStats, fetch_worker_stats, start_worker};

/// Everything needed to start a [`Coordinator`].
pub struct CoordinatorConfig {
    pub db: DbConfig,
    pub queue: QueueConfig,
    pub hub: HubConfig,
    pub worker: WorkerConfig,
    pub collector: Arc<dyn LineageCollector>,
    /// OpenLineage namespace for jobs.
    pub namespace: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            db: DbConfig::memory(),
            queue: QueueConfig::default(),
            hub: HubConfig::default(),
            worker: WorkerConfig::default(),
            collector: Arc::new(NoopCollector),
            namespace: "default".to_string(),
        }
    }
}

/// A running coordinator.
pub struct Coordinator {
    pub db: Database,
    pub machine: Arc<RunStateMachine>,
    pub queue: Arc<DurableQueue>,
    pub hub: Arc<EventHub>,
    pub producer: Arc<RunProducer>,
    worker: ActorRef<WorkerMessage>,
    worker_handle: JoinHandle<()>,
    monitor: ActorRef<MonitorMessage>,
    monitor_handle: JoinHandle<()>,
}

impl Coordinator {
    /// Connect storage and start the worker and hub monitor.
    pub async fn start(config: CoordinatorConfig) -> Result<Self, ActorError> {
        tracing::info!("Initializing lineage coordinator...");

        let db = db::init(&config.db).await?;
        let machine = Arc::new(RunStateMachine::new(db.clone()));
        let queue = Arc::new(DurableQueue::new(db.clone(), config.queue));
        let hub = Arc::new(EventHub::new(config.hub));
        let producer = Arc::new(RunProducer::new(machine.clone(), queue.clone()));

        let processor = EventProcessor::new(queue.clone(), machine.clone(), hub.clone())
            .with_collector(config.collector)
            .with_backoff(config.worker.backoff)
            .with_namespace(config.namespace);

        let (worker, worker_handle) =
            start_worker(config.worker, Arc::new(processor), hub.clone()).await?;
        let (monitor, monitor_handle) = start_hub_monitor(hub.clone()).await?;

        tracing::info!("Lineage coordinator initialized");
        Ok(Self {
            db,
            machine,
            queue,
            hub,
            producer,
            worker,
            worker_handle,
            monitor,
            monitor_handle,
        })
    }

    /// The worker supervisor.
    pub fn worker(&self) -> &ActorRef<WorkerMessage> {
        &self.worker
    }

    /// Processing counters from the worker.
    pub async fn worker_stats(&self) -> Result<WorkerStats, ActorError> {
        fetch_worker_stats(&self.worker).await
    }

    /// Stop the worker after its in-flight batches, then disconnect observers.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down lineage coordinator");

        if self.worker.send_message(WorkerMessage::Shutdown).is_ok() {
            let _ = self.worker_handle.await;
        }
        if self.monitor.send_message(MonitorMessage::Shutdown).is_ok() {
            let _ = self.monitor_handle.await;
        }
    }
}
