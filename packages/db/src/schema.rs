//! Database schema definitions using SurrealQL.

use crate::{Database, DbError};

/// Initialize the database schema.
///
/// Idempotent; safe to run on every startup.
pub async fn init_schema(db: &Database) -> Result<(), DbError> {
    tracing::info!("Initializing database schema...");

    db.query(JOB_SCHEMA).await?.check()?;
    db.query(RUN_SCHEMA).await?.check()?;
    db.query(QUEUE_SCHEMA).await?.check()?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Job table schema. Records are keyed by job name.
const JOB_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS job SCHEMALESS;

DEFINE INDEX IF NOT EXISTS job_name ON job FIELDS name UNIQUE;
"#;

/// Run table schema. Records are keyed by run id.
const RUN_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS run SCHEMALESS;

-- Secondary lookups: runs of a job, idempotent starts
DEFINE INDEX IF NOT EXISTS run_job ON run FIELDS job_name;
DEFINE INDEX IF NOT EXISTS run_job_idempotency ON run FIELDS job_name, idempotency_key;
DEFINE INDEX IF NOT EXISTS run_state ON run FIELDS state;
"#;

/// Durable queue schema.
///
/// Times are stored as unix milliseconds so visibility comparisons stay
/// numeric.
const QUEUE_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS queue_message SCHEMALESS;
DEFINE INDEX IF NOT EXISTS queue_message_seq ON queue_message FIELDS queue, sequence_id UNIQUE;
DEFINE INDEX IF NOT EXISTS queue_message_visible ON queue_message FIELDS queue, visible_at_ms;

DEFINE TABLE IF NOT EXISTS dead_letter SCHEMALESS;
DEFINE INDEX IF NOT EXISTS dead_letter_seq ON dead_letter FIELDS queue, sequence_id UNIQUE;

-- Per-queue sequence counters
DEFINE TABLE IF NOT EXISTS queue_sequence SCHEMALESS;
"#;
