//! SurrealDB integration for the lineage run coordinator.
//!
//! This crate provides database connectivity, repositories for jobs and
//! runs, and the durable event queue with its dead-letter table.
//!
//! The [`Database`] handle is passed explicitly to every repository, so
//! tests can open a fresh in-memory instance each.
//!
//! # Features
//!
//! - `memory` (default): Use in-memory storage for testing
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod connection;
pub mod queue;
pub mod repositories;
mod schema;

pub use connection::{Database, DbConfig, DbError, connect};
pub use queue::{DurableQueue, LeaseHandle, LeasedMessage, NackOutcome};
pub use schema::init_schema;

/// Connect and initialize the schema.
///
/// This should be called once at application startup.
pub async fn init(config: &DbConfig) -> Result<Database, DbError> {
    let db = connect(config).await?;
    init_schema(&db).await?;
    Ok(db)
}
