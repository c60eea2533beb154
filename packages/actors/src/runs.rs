//! Run state machine: validates and stores job/run lifecycle changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use db::Database;
use db::repositories::{JobRepository, RunRepository};
use lineage_core::{
    CoreError, CoreResult, Job, Run, RunChange, RunId, RunState, TransitionOutcome,
    check_transition,
};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Async locks keyed by string, dropped from the map once unused.
#[derive(Default)]
pub(crate) struct KeyedLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub(crate) async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Forget `key` if nobody holds or waits on its lock.
    pub(crate) fn prune(&self, key: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A stored run together with what the transition did to it.
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub run: Run,
    pub outcome: TransitionOutcome,
}

/// Owns job and run records and enforces the run lifecycle.
///
/// Transitions for one run are serialized; different runs proceed in
/// parallel.
pub struct RunStateMachine {
    jobs: JobRepository,
    runs: RunRepository,
    locks: KeyedLocks,
}

impl RunStateMachine {
    pub fn new(db: Database) -> Self {
        Self {
            jobs: JobRepository::new(db.clone()),
            runs: RunRepository::new(db),
            locks: KeyedLocks::default(),
        }
    }

    /// Register a job. `Conflict` if the name is taken.
    pub async fn register_job(&self, name: &str, metadata: Value) -> CoreResult<Job> {
        let job = Job::new(name, metadata)?;
        let key = format!("job:{}", job.name);
        let result = {
            let _guard = self.locks.lock(&key).await;
            self.jobs.create(&job).await
        };
        self.locks.prune(&key);

        let job = result?;
        tracing::info!("Registered job '{}'", job.name);
        Ok(job)
    }

    pub async fn get_job(&self, name: &str) -> CoreResult<Job> {
        Ok(self.jobs.get(name).await?)
    }

    pub async fn list_jobs(&self) -> CoreResult<Vec<Job>> {
        Ok(self.jobs.list().await?)
    }

    pub async fn update_job_metadata(&self, name: &str, metadata: Value) -> CoreResult<Job> {
        Ok(self.jobs.update_metadata(name, metadata).await?)
    }

    /// Persist a new PENDING run for a registered job.
    ///
    /// A repeated `(job_name, idempotency_key)` pair is a `Conflict`.
    pub async fn start_run(
        &self,
        job_name: &str,
        metadata: Value,
        idempotency_key: Option<String>,
    ) -> CoreResult<Run> {
        let key = format!("job:{}", job_name);
        let result = {
            let _guard = self.locks.lock(&key).await;
            self.create_run(job_name, metadata, idempotency_key).await
        };
        self.locks.prune(&key);
        result
    }

    async fn create_run(
        &self,
        job_name: &str,
        metadata: Value,
        idempotency_key: Option<String>,
    ) -> CoreResult<Run> {
        self.jobs.get(job_name).await?;

        if let Some(key) = idempotency_key.as_deref()
            && let Some(existing) = self.runs.find_by_idempotency_key(job_name, key).await?
        {
            return Err(CoreError::Conflict(format!(
                "run {} already started for job '{}' with idempotency key '{}'",
                existing.run_id, job_name, key
            )));
        }

        let run = Run::new(job_name, metadata).with_idempotency_key(idempotency_key);
        let run = self.runs.create(&run).await?;
        tracing::info!("Started run {} for job '{}'", run.run_id, job_name);
        Ok(run)
    }

    /// Drop a PENDING run whose START event never reached the queue.
    ///
    /// Frees the idempotency key for a retry.
    pub async fn discard_run(&self, run: &Run) -> CoreResult<()> {
        let key = format!("job:{}", run.job_name);
        let result = {
            let _guard = self.locks.lock(&key).await;
            self.runs.delete(run.run_id).await
        };
        self.locks.prune(&key);

        result?;
        tracing::info!("Discarded run {} for job '{}'", run.run_id, run.job_name);
        Ok(())
    }

    /// Check a transition against the stored run without applying it.
    pub async fn validate_transition(
        &self,
        run_id: RunId,
        next: RunState,
        change: &RunChange,
    ) -> CoreResult<AppliedTransition> {
        let run = self.runs.get(run_id).await?;
        let outcome = check_transition(run.state, next, change)?;
        Ok(AppliedTransition { run, outcome })
    }

    /// Apply a transition and store the result.
    ///
    /// Re-applying the current terminal state returns the stored run
    /// unchanged with [`TransitionOutcome::NoOp`].
    pub async fn apply_transition(
        &self,
        run_id: RunId,
        next: RunState,
        change: &RunChange,
    ) -> CoreResult<AppliedTransition> {
        let key = format!("run:{}", run_id);
        let result = {
            let _guard = self.locks.lock(&key).await;
            self.apply_locked(run_id, next, change).await
        };
        self.locks.prune(&key);
        result
    }

    async fn apply_locked(
        &self,
        run_id: RunId,
        next: RunState,
        change: &RunChange,
    ) -> CoreResult<AppliedTransition> {
        let mut run = self.runs.get(run_id).await?;
        let previous = run.state;
        let outcome = run.apply(next, change, Utc::now())?;

        if outcome == TransitionOutcome::Applied {
            run = self.runs.save(&run).await?;
            tracing::debug!("Run {} {} -> {}", run_id, previous, next);
        }

        Ok(AppliedTransition { run, outcome })
    }

    pub async fn get_run(&self, run_id: RunId) -> CoreResult<Run> {
        Ok(self.runs.get(run_id).await?)
    }

    pub async fn list_runs_for_job(&self, job_name: &str) -> CoreResult<Vec<Run>> {
        Ok(self.runs.list_for_job(job_name).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyed_locks_are_pruned_after_use() {
        let locks = KeyedLocks::default();
        {
            let _a = locks.lock("run:a").await;
            let _b = locks.lock("run:b").await;
            assert_eq!(locks.len(), 2);
        }
        locks.prune("run:a");
        assert_eq!(locks.len(), 1);
        locks.prune("run:b");
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let guard = locks.lock("run:x").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("run:x").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }
}
