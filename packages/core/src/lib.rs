//! Core domain types for the lineage run coordinator.
//!
//! This crate contains shared types used across all packages:
//! - Job, Run and the run transition table
//! - The event envelope and its JSON and SSE codecs
//! - Queue configuration and statistics
//! - The error taxonomy

pub mod codec;
mod error;
mod events;
mod job;
mod queue;
mod run;

pub use codec::SseFrame;
pub use error::{CoreError, CoreResult};
pub use events::{Event, EventBody, EventKind, LineagePhase};
pub use job::{Job, validate_job_name};
pub use queue::{DeadLetter, QueueConfig, QueueStats};
pub use run::{
    Artifact, Run, RunChange, RunId, RunState, TransitionOutcome, check_transition,
    merge_metadata,
};
