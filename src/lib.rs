// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod queue;
pub mod queuer;
pub mod schedule;
pub mod state;
pub mod task;
pub mod template;
pub mod worker;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::config::{PipelineSettings, ProviderSet};
pub use crate::error::PipelineError;
pub use crate::queuer::Queuer;
pub use crate::state::{PipelineState, WorkerStatus};
pub use crate::worker::Worker;
