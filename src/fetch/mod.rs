// src/fetch/mod.rs
//! The external fetch-and-store collaborator the Worker hands each task to.
//!
//! Implementations never fail across this boundary: provider or storage
//! errors are folded into [`FetchOutcome::success`] and the Worker's retry
//! policy takes it from there.

pub mod http;
pub mod sink;

use async_trait::async_trait;

use crate::config::DownloadWindow;
use crate::task::Task;

pub use http::HttpFetcher;
pub use sink::{JsonFileSink, SeriesSink};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub records_written: usize,
    pub success: bool,
}

impl FetchOutcome {
    pub fn stored(records_written: usize) -> Self {
        Self {
            records_written,
            success: true,
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn process(&self, task: &Task, window: &DownloadWindow) -> FetchOutcome;
    fn name(&self) -> &'static str;
}
