//! Per-observer types: identity, health counters and the receiving half of
//! a registration.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lineage_core::Event;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use ulid::Ulid;

use super::HubConfig;

/// Unique identifier for an observer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Ulid);

impl ClientId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why an observer was declared a zombie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZombieReason {
    WriteErrors,
    MissedPings,
    QueueFull,
    Inactive,
    PongTimeout,
}

impl ZombieReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZombieReason::WriteErrors => "write_errors",
            ZombieReason::MissedPings => "missed_pings",
            ZombieReason::QueueFull => "queue_full",
            ZombieReason::Inactive => "inactive",
            ZombieReason::PongTimeout => "pong_timeout",
        }
    }
}

impl std::fmt::Display for ZombieReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an observer's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Zombie(ZombieReason),
    /// Client went away or was disconnected by an operator.
    Disconnected,
    Shutdown,
}

/// Mutable liveness state for one observer.
#[derive(Debug, Clone)]
pub(crate) struct ClientHealth {
    pub consecutive_write_errors: u32,
    pub missed_pings: u32,
    pub consecutive_full_queue_count: u32,
    pub last_activity_at: Instant,
    pub last_ping_sent_at: Option<Instant>,
    pub first_unanswered_ping_at: Option<Instant>,
    pub pong_received: bool,
    pub ping_count: u64,
    pub events_written: u64,
    pub events_dropped: u64,
}

impl ClientHealth {
    pub fn new(now: Instant) -> Self {
        Self {
            consecutive_write_errors: 0,
            missed_pings: 0,
            consecutive_full_queue_count: 0,
            last_activity_at: now,
            last_ping_sent_at: None,
            first_unanswered_ping_at: None,
            pong_received: false,
            ping_count: 0,
            events_written: 0,
            events_dropped: 0,
        }
    }

    /// First eviction rule this observer breaks, if any.
    pub fn zombie_reason(&self, now: Instant, config: &HubConfig) -> Option<ZombieReason> {
        if self.consecutive_write_errors > config.max_write_errors {
            return Some(ZombieReason::WriteErrors);
        }
        if self.missed_pings > config.max_missed_pings {
            return Some(ZombieReason::MissedPings);
        }
        if self.consecutive_full_queue_count >= config.max_full_queue_count {
            return Some(ZombieReason::QueueFull);
        }
        if self
            .first_unanswered_ping_at
            .is_some_and(|sent| now.duration_since(sent) > config.pong_timeout)
        {
            return Some(ZombieReason::PongTimeout);
        }
        if now.duration_since(self.last_activity_at) > config.inactivity_timeout {
            return Some(ZombieReason::Inactive);
        }
        None
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(self.last_activity_at)
    }
}

/// Cleared when the connection side of a registration is dropped.
#[derive(Debug)]
pub(crate) struct Attachment(pub Arc<AtomicBool>);

impl Drop for Attachment {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The connection's half of a registration.
///
/// `events` yields queued events until the observer is evicted or
/// disconnected; `closed` resolves with the reason when that happens.
#[derive(Debug)]
pub struct ClientStream {
    pub client_id: ClientId,
    pub events: mpsc::Receiver<Event>,
    pub closed: oneshot::Receiver<CloseReason>,
    pub(crate) _attachment: Attachment,
}
