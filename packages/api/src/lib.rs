//! HTTP surface of the lineage coordinator.
//!
//! - Producer routes for jobs and runs
//! - Observer event streams over Server-Sent Events
//! - Admin introspection for the hub and the durable queue

mod admin;
mod error;
mod events;
mod runs;

pub mod router;
pub mod state;

pub use error::ApiError;
pub use events::ChannelSink;
pub use router::build_router;
pub use state::AppState;
