//! Job domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CoreError, CoreResult};

/// A named, registered unit of work that runs are started against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job name.
    pub name: String,
    /// Opaque metadata; the only field mutated after registration.
    #[serde(default)]
    pub metadata: Value,
    /// When the job was registered.
    pub created_at: DateTime<Utc>,
    /// When the metadata last changed.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job, validating its name.
    pub fn new(name: impl Into<String>, metadata: Value) -> CoreResult<Self> {
        let name = name.into();
        validate_job_name(&name)?;
        let now = Utc::now();
        Ok(Self {
            name,
            metadata: if metadata.is_null() {
                Value::Object(Default::default())
            } else {
                metadata
            },
            created_at: now,
            updated_at: now,
        })
    }
}

/// Job names are used as record keys and URL path segments.
pub fn validate_job_name(name: &str) -> CoreResult<()> {
    if name.trim().is_empty() {
        return Err(CoreError::InvalidInput("job name must not be empty".into()));
    }
    if name.len() > 255 {
        return Err(CoreError::InvalidInput(
            "job name must be at most 255 characters".into(),
        ));
    }
    Ok(())
}
