//! Repository implementations for database operations.

mod job_repo;
mod run_repo;

pub use job_repo::JobRepository;
pub use run_repo::RunRepository;
