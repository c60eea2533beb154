//! Job repository.

use chrono::Utc;
use lineage_core::Job;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surrealdb::sql::Thing;

use crate::{Database, DbError};

/// Repository for job persistence operations.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct JobRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    #[serde(flatten)]
    job: Job,
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a new job. Fails with `Conflict` if the name is taken.
    pub async fn create(&self, job: &Job) -> Result<Job, DbError> {
        if self.exists(&job.name).await? {
            return Err(DbError::Conflict(format!("Job already exists: {}", job.name)));
        }

        let record: Option<JobRecord> = self
            .db
            .create(("job", job.name.as_str()))
            .content(JobRecord {
                id: None,
                job: job.clone(),
            })
            .await?;

        record
            .map(|r| r.job)
            .ok_or_else(|| DbError::Query("Failed to create job".into()))
    }

    /// Get a job by name.
    pub async fn get(&self, name: &str) -> Result<Job, DbError> {
        let record: Option<JobRecord> = self.db.select(("job", name)).await?;

        record
            .map(|r| r.job)
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", name)))
    }

    /// Check whether a job is registered.
    pub async fn exists(&self, name: &str) -> Result<bool, DbError> {
        let record: Option<JobRecord> = self.db.select(("job", name)).await?;
        Ok(record.is_some())
    }

    /// Replace a job's metadata.
    pub async fn update_metadata(&self, name: &str, metadata: Value) -> Result<Job, DbError> {
        let mut job = self.get(name).await?;
        job.metadata = metadata;
        job.updated_at = Utc::now();

        let record: Option<JobRecord> = self
            .db
            .update(("job", name))
            .content(JobRecord { id: None, job })
            .await?;

        record
            .map(|r| r.job)
            .ok_or_else(|| DbError::NotFound(format!("Job not found: {}", name)))
    }

    /// List all jobs ordered by name.
    pub async fn list(&self) -> Result<Vec<Job>, DbError> {
        let mut response = self.db.query("SELECT * FROM job ORDER BY name ASC").await?;
        let records: Vec<JobRecord> = response.take(0)?;

        Ok(records.into_iter().map(|r| r.job).collect())
    }
}
