//! Run repository.

use lineage_core::{Run, RunId};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{Database, DbError};

/// Repository for run persistence operations.
#[derive(Clone)]
pub struct RunRepository {
    db: Database,
}

/// Internal record type for SurrealDB.
#[derive(Debug, Serialize, Deserialize)]
struct RunRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Thing>,
    #[serde(flatten)]
    run: Run,
}

impl RunRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new run.
    pub async fn create(&self, run: &Run) -> Result<Run, DbError> {
        let record: Option<RunRecord> = self
            .db
            .create(("run", run.run_id.to_string()))
            .content(RunRecord {
                id: None,
                run: run.clone(),
            })
            .await?;

        record
            .map(|r| r.run)
            .ok_or_else(|| DbError::Query("Failed to create run".into()))
    }

    /// Get a run by ID.
    pub async fn get(&self, run_id: RunId) -> Result<Run, DbError> {
        let record: Option<RunRecord> = self.db.select(("run", run_id.to_string())).await?;

        record
            .map(|r| r.run)
            .ok_or_else(|| DbError::NotFound(format!("Run not found: {}", run_id)))
    }

    /// Overwrite a stored run.
    pub async fn save(&self, run: &Run) -> Result<Run, DbError> {
        let record: Option<RunRecord> = self
            .db
            .update(("run", run.run_id.to_string()))
            .content(RunRecord {
                id: None,
                run: run.clone(),
            })
            .await?;

        record
            .map(|r| r.run)
            .ok_or_else(|| DbError::NotFound(format!("Run not found: {}", run.run_id)))
    }

    /// Remove a run. Missing runs are not an error.
    pub async fn delete(&self, run_id: RunId) -> Result<(), DbError> {
        let _: Option<RunRecord> = self.db.delete(("run", run_id.to_string())).await?;
        Ok(())
    }

    /// Runs of a job, oldest first.
    pub async fn list_for_job(&self, job_name: &str) -> Result<Vec<Run>, DbError> {
        let mut response = self
            .db
            .query("SELECT * FROM run WHERE job_name = $job_name ORDER BY run_id ASC")
            .bind(("job_name", job_name.to_string()))
            .await?;
        let records: Vec<RunRecord> = response.take(0)?;

        Ok(records.into_iter().map(|r| r.run).collect())
    }

    /// Find the run started for a job with the given idempotency key.
    pub async fn find_by_idempotency_key(
        &self,
        job_name: &str,
        key: &str,
    ) -> Result<Option<Run>, DbError> {
        let mut response = self
            .db
            .query(
                "SELECT * FROM run WHERE job_name = $job_name AND idempotency_key = $key LIMIT 1",
            )
            .bind(("job_name", job_name.to_string()))
            .bind(("key", key.to_string()))
            .await?;
        let records: Vec<RunRecord> = response.take(0)?;

        Ok(records.into_iter().next().map(|r| r.run))
    }
}
