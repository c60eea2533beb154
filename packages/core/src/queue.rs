//! Durable queue configuration and reporting types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for a durable event queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name; all records are partitioned by it.
    pub name: String,
    /// Deliveries allowed before a message is dead-lettered.
    pub max_delivery_attempts: u32,
    /// How long a leased message stays hidden (seconds).
    pub visibility_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "lineage_events".to_string(),
            max_delivery_attempts: 3,
            visibility_timeout_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts.max(1);
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

/// Point-in-time statistics for a durable queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueStats {
    pub queue_name: String,
    /// Messages waiting or leased.
    pub depth: u64,
    /// Messages currently leased.
    pub in_flight: u64,
    pub dead_letter_depth: u64,
    /// Acknowledged messages per minute over the last sample window.
    pub throughput_per_min: f64,
}

/// A message that exhausted its retry budget or failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub queue_name: String,
    pub sequence_id: u64,
    /// Raw stored payload; may not decode.
    pub payload: String,
    pub failure_reason: String,
    pub attempt_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}
