//! Runtime of the lineage coordinator.
//!
//! This crate provides the run state machine, the Ractor-based queue
//! worker, and the event hub that streams events to observers.
//!
//! # Architecture
//!
//! - `RunProducer` - Validates run requests and enqueues lineage events
//! - `WorkerSupervisor` - Owns a pool of `PollerActor`s draining the queue
//! - `EventProcessor` - Applies one queued event to its run
//! - `EventHub` - Fans events out to observers and evicts dead ones
//! - `HubMonitor` - Pings observers and sweeps zombies on timers
//!
//! # Usage
//!
//! ```ignore
//! use actors::{Coordinator, CoordinatorConfig};
//!
//! let coordinator = Coordinator::start(CoordinatorConfig::default()).await?;
//! coordinator.producer.start_run("orders", json!({}), None).await?;
//! coordinator.shutdown().await;
//! ```

mod backoff;
mod collector;
mod coordinator;
pub mod hub;
mod messages;
mod processor;
mod producer;
mod runs;
mod worker;

pub use backoff::BackoffPolicy;
pub use collector::{
    CollectorError, CollectorFuture, HttpCollector, LineageCollector, LoggingCollector,
    NoopCollector, OpenLineageEvent,
};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use hub::{
    ClientId, ClientStream, CloseReason, EventHub, HubConfig, HubMonitor, PublishOutcome,
    ZombieReason, start_hub_monitor,
};
pub use messages::{ActorError, MonitorMessage, PollerMessage, WorkerMessage};
pub use processor::{EventProcessor, ProcessOutcome};
pub use producer::{QueuedChange, RunProducer};
pub use runs::{AppliedTransition, RunStateMachine};
pub use worker::{
    PollerActor, WorkerConfig, WorkerStats, WorkerSupervisor, fetch_worker_stats, start_worker,
};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
