//! Message types for actor communication.

use ractor::RpcReplyPort;

use crate::worker::WorkerStats;

/// Messages for the HubMonitor.
#[derive(Debug)]
pub enum MonitorMessage {
    /// Ping every observer.
    Ping,

    /// Evict zombies.
    Sweep,

    /// Disconnect all observers and stop.
    Shutdown,
}

/// Messages for a PollerActor.
#[derive(Debug)]
pub enum PollerMessage {
    /// Lease and process one batch.
    Poll,
}

/// Messages for the WorkerSupervisor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Publish a queue status snapshot.
    Metrics,

    /// Get processing counters.
    GetStats { reply: RpcReplyPort<WorkerStats> },

    /// Stop all pollers, then stop.
    Shutdown,
}

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("Database error: {0}")]
    Database(#[from] db::DbError),

    #[error("Failed to spawn actor: {0}")]
    Spawn(#[from] ractor::SpawnErr),

    #[error("Actor error: {0}")]
    Actor(String),

    #[error("Timeout")]
    Timeout,
}
