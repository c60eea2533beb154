//! Run domain types and the run lifecycle transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::{CoreError, CoreResult};

/// Unique identifier for a run, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Create a new unique run ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a run ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunState {
    /// Check if the run can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Completed => "COMPLETED",
            RunState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(RunState::Pending),
            "RUNNING" => Ok(RunState::Running),
            "COMPLETED" => Ok(RunState::Completed),
            "FAILED" => Ok(RunState::Failed),
            other => Err(CoreError::InvalidInput(format!(
                "unknown run state '{}'",
                other
            ))),
        }
    }
}

/// An output produced by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
}

impl Artifact {
    pub fn new(kind: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            uri: uri.into(),
        }
    }
}

/// Data carried alongside a state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunChange {
    /// Required when moving to FAILED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Appended to the run's artifact list.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    /// Shallow-merged into the run's metadata.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl RunChange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Whether a transition changed the run or was an accepted repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    NoOp,
}

/// Validate moving a run from `current` to `next`.
///
/// PENDING may move to any other state, RUNNING may move to a terminal state,
/// and nothing leaves a terminal state. Repeating the current terminal state
/// (or RUNNING while running) is accepted as a no-op.
pub fn check_transition(
    current: RunState,
    next: RunState,
    change: &RunChange,
) -> CoreResult<TransitionOutcome> {
    use RunState::*;

    let outcome = match (current, next) {
        (_, Pending) => {
            return Err(CoreError::InvalidTransition(format!(
                "cannot move run from {} back to PENDING",
                current
            )));
        }
        (Pending, _) => TransitionOutcome::Applied,
        (Running, Running) => TransitionOutcome::NoOp,
        (Running, _) => TransitionOutcome::Applied,
        (Completed, Completed) | (Failed, Failed) => TransitionOutcome::NoOp,
        (Completed, Failed) | (Failed, Completed) => {
            return Err(CoreError::Conflict(format!(
                "run already finished as {}, cannot become {}",
                current, next
            )));
        }
        (Completed | Failed, Running) => {
            return Err(CoreError::InvalidTransition(format!(
                "run already finished as {}, cannot become {}",
                current, next
            )));
        }
    };

    if outcome == TransitionOutcome::Applied
        && next == Failed
        && change.error_message.as_deref().is_none_or(str::is_empty)
    {
        return Err(CoreError::InvalidTransition(
            "FAILED requires an error message".into(),
        ));
    }

    Ok(outcome)
}

/// Shallow-merge `patch` into `target`. Non-object patches replace the target.
pub fn merge_metadata(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch) {
        (_, Value::Null) => {}
        (Some(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// One execution instance of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    pub job_name: String,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Create a new pending run for a job.
    pub fn new(job_name: impl Into<String>, metadata: Value) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::new(),
            job_name: job_name.into(),
            state: RunState::Pending,
            started_at: now,
            ended_at: None,
            error_message: None,
            artifacts: Vec::new(),
            metadata: if metadata.is_null() {
                Value::Object(Default::default())
            } else {
                metadata
            },
            idempotency_key: None,
            updated_at: now,
        }
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key;
        self
    }

    /// Apply a state change in place.
    ///
    /// On `NoOp` the run is left untouched.
    pub fn apply(
        &mut self,
        next: RunState,
        change: &RunChange,
        now: DateTime<Utc>,
    ) -> CoreResult<TransitionOutcome> {
        let outcome = check_transition(self.state, next, change)?;
        if outcome == TransitionOutcome::NoOp {
            return Ok(outcome);
        }

        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        if next == RunState::Failed {
            self.error_message = change.error_message.clone();
        }
        self.artifacts.extend(change.artifacts.iter().cloned());
        merge_metadata(&mut self.metadata, &change.metadata);
        self.updated_at = now;

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pending_reaches_every_non_pending_state() {
        for next in [RunState::Running, RunState::Completed] {
            assert_eq!(
                check_transition(RunState::Pending, next, &RunChange::new()),
                Ok(TransitionOutcome::Applied)
            );
        }
        let failed = RunChange::new().with_error("boom");
        assert_eq!(
            check_transition(RunState::Pending, RunState::Failed, &failed),
            Ok(TransitionOutcome::Applied)
        );
    }

    #[test]
    fn unknown_state_name_is_invalid_input() {
        assert_eq!("failed".parse::<RunState>(), Ok(RunState::Failed));
        assert!(matches!("DONE".parse::<RunState>(), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn terminal_states_are_sticky() {
        let change = RunChange::new().with_error("late");
        assert_eq!(
            check_transition(RunState::Completed, RunState::Completed, &RunChange::new()),
            Ok(TransitionOutcome::NoOp)
        );
        assert_eq!(
            check_transition(RunState::Failed, RunState::Failed, &change),
            Ok(TransitionOutcome::NoOp)
        );
        assert!(matches!(
            check_transition(RunState::Completed, RunState::Failed, &change),
            Err(CoreError::Conflict(_))
        ));
        assert!(matches!(
            check_transition(RunState::Failed, RunState::Running, &change),
            Err(CoreError::InvalidTransition(_))
        ));
        assert!(matches!(
            check_transition(RunState::Running, RunState::Pending, &change),
            Err(CoreError::InvalidTransition(_))
        ));
    }

    #[test]
    fn failing_without_message_is_rejected() {
        let result = check_transition(RunState::Running, RunState::Failed, &RunChange::new());
        assert!(matches!(result, Err(CoreError::InvalidTransition(_))));
    }

    #[test]
    fn apply_sets_terminal_fields_once() {
        let mut run = Run::new("etl", json!({"owner": "data"}));
        let now = Utc::now();
        let change = RunChange::new()
            .with_artifacts(vec![Artifact::new("table", "s3://lake/orders")])
            .with_metadata(json!({"rows": 10}));

        assert_eq!(
            run.apply(RunState::Completed, &change, now),
            Ok(TransitionOutcome::Applied)
        );
        assert_eq!(run.ended_at, Some(now));
        assert_eq!(run.artifacts.len(), 1);
        assert_eq!(run.metadata, json!({"owner": "data", "rows": 10}));

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(
            run.apply(RunState::Completed, &change, later),
            Ok(TransitionOutcome::NoOp)
        );
        assert_eq!(run.ended_at, Some(now));
        assert_eq!(run.artifacts.len(), 1);
    }

    #[test]
    fn state_parses_case_insensitively() {
        assert_eq!("completed".parse::<RunState>(), Ok(RunState::Completed));
        assert!("DONE".parse::<RunState>().is_err());
    }
}
