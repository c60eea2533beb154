//! Event types flowing through the queue and out to observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, RunChange, RunId, RunState};

/// Wire tag identifying an event variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LineageEvent,
    JobStatus,
    QueueStatus,
    SystemMetric,
    Error,
    Heartbeat,
    Ping,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::LineageEvent,
        EventKind::JobStatus,
        EventKind::QueueStatus,
        EventKind::SystemMetric,
        EventKind::Error,
        EventKind::Heartbeat,
        EventKind::Ping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LineageEvent => "lineage_event",
            EventKind::JobStatus => "job_status",
            EventKind::QueueStatus => "queue_status",
            EventKind::SystemMetric => "system_metric",
            EventKind::Error => "error",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Ping => "ping",
        }
    }

    /// Control events reach every observer regardless of subscription.
    pub fn is_control(&self) -> bool {
        matches!(self, EventKind::Heartbeat | EventKind::Ping)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown event type '{}'", s)))
    }
}

/// Phase of a lineage event, mirroring the OpenLineage run event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LineagePhase {
    Start,
    Running,
    Complete,
    Fail,
}

impl LineagePhase {
    /// Run state a worker moves the run into when applying this phase.
    ///
    /// START is applied as RUNNING; the run was already persisted as
    /// PENDING when it was started.
    pub fn target_state(&self) -> RunState {
        match self {
            LineagePhase::Start | LineagePhase::Running => RunState::Running,
            LineagePhase::Complete => RunState::Completed,
            LineagePhase::Fail => RunState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LineagePhase::Start => "START",
            LineagePhase::Running => "RUNNING",
            LineagePhase::Complete => "COMPLETE",
            LineagePhase::Fail => "FAIL",
        }
    }
}

/// Closed set of event payloads.
///
/// Serialized adjacently tagged as `{"type": <tag>, "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventBody {
    /// A run changed phase.
    LineageEvent {
        run_id: RunId,
        job_name: String,
        phase: LineagePhase,
        #[serde(default)]
        payload: RunChange,
    },
    /// A run's state as seen by dashboards.
    JobStatus {
        job_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<f64>,
    },
    /// Periodic queue health sample.
    QueueStatus {
        queue_name: String,
        depth: u64,
        in_flight: u64,
        dead_letter_depth: u64,
        throughput_per_min: f64,
    },
    SystemMetric {
        metric_type: String,
        value: f64,
        #[serde(default)]
        metadata: Value,
    },
    Error {
        error_type: String,
        message: String,
        #[serde(default)]
        details: Value,
    },
    Heartbeat,
    /// Liveness ping; observers answer with a pong.
    Ping { ping_id: u64 },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::LineageEvent { .. } => EventKind::LineageEvent,
            EventBody::JobStatus { .. } => EventKind::JobStatus,
            EventBody::QueueStatus { .. } => EventKind::QueueStatus,
            EventBody::SystemMetric { .. } => EventKind::SystemMetric,
            EventBody::Error { .. } => EventKind::Error,
            EventBody::Heartbeat => EventKind::Heartbeat,
            EventBody::Ping { .. } => EventKind::Ping,
        }
    }

    /// Run this event refers to, if any.
    pub fn run_id(&self) -> Option<RunId> {
        match self {
            EventBody::LineageEvent { run_id, .. } => Some(*run_id),
            EventBody::JobStatus { run_id, .. } => *run_id,
            _ => None,
        }
    }

    /// Build an error event from a processing failure.
    pub fn error(error: &CoreError, details: Value) -> Self {
        EventBody::Error {
            error_type: error.as_str().to_string(),
            message: error.to_string(),
            details,
        }
    }

    /// Get a short description of this event for logging.
    pub fn description(&self) -> String {
        match self {
            EventBody::LineageEvent {
                run_id,
                job_name,
                phase,
                ..
            } => format!("Run {} of '{}' -> {}", run_id, job_name, phase.as_str()),
            EventBody::JobStatus {
                job_name, status, ..
            } => format!("Job '{}' is {}", job_name, status),
            EventBody::QueueStatus {
                queue_name, depth, ..
            } => format!("Queue '{}' depth {}", queue_name, depth),
            EventBody::SystemMetric {
                metric_type, value, ..
            } => format!("Metric {} = {}", metric_type, value),
            EventBody::Error {
                error_type,
                message,
                ..
            } => format!("Error {}: {}", error_type, message),
            EventBody::Heartbeat => "Heartbeat".to_string(),
            EventBody::Ping { ping_id } => format!("Ping {}", ping_id),
        }
    }
}

/// Immutable event envelope.
///
/// `sequence_id` is the queue sequence while the event sits in the durable
/// queue and the hub's stream sequence once it is published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub body: EventBody,
}

impl Event {
    /// Create an unsequenced event stamped with the current time.
    pub fn new(body: EventBody) -> Self {
        Self {
            sequence_id: 0,
            timestamp: Utc::now(),
            body,
        }
    }

    pub fn with_sequence(mut self, sequence_id: u64) -> Self {
        self.sequence_id = sequence_id;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn lineage(
        run_id: RunId,
        job_name: impl Into<String>,
        phase: LineagePhase,
        payload: RunChange,
    ) -> Self {
        Self::new(EventBody::LineageEvent {
            run_id,
            job_name: job_name.into(),
            phase,
            payload,
        })
    }

    pub fn heartbeat() -> Self {
        Self::new(EventBody::Heartbeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_uses_type_and_data_keys() {
        let body = EventBody::JobStatus {
            job_name: "etl".into(),
            run_id: None,
            status: "RUNNING".into(),
            progress: Some(0.5),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({"type": "job_status", "data": {"job_name": "etl", "status": "RUNNING", "progress": 0.5}})
        );
    }

    #[test]
    fn heartbeat_has_no_data() {
        let value = serde_json::to_value(EventBody::Heartbeat).unwrap();
        assert_eq!(value, json!({"type": "heartbeat"}));
        let back: EventBody = serde_json::from_value(value).unwrap();
        assert_eq!(back, EventBody::Heartbeat);
    }

    #[test]
    fn kinds_parse_from_wire_tags() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("lineage".parse::<EventKind>().is_err());
        assert!(EventKind::Ping.is_control());
        assert!(!EventKind::Error.is_control());
    }

    #[test]
    fn start_phase_moves_run_to_running() {
        assert_eq!(LineagePhase::Start.target_state(), RunState::Running);
        assert_eq!(LineagePhase::Fail.target_state(), RunState::Failed);
    }
}
