// src/error.rs
//! Configuration-class errors. These are the only failures surfaced to the
//! orchestrator; provider and queue trouble degrades to progress counters.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{0} is a required input and it was not provided")]
    MissingSetting(&'static str),

    #[error("invalid value for {field}: {value:?}")]
    InvalidSetting { field: &'static str, value: String },

    #[error("download window is empty: start {start} is after end {end}")]
    EmptyDownloadWindow {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error("invalid provider configuration: {0}")]
    InvalidProvider(String),

    #[error("no rate limit forwarded for provider {0}")]
    MissingRateLimit(String),

    #[error("reading provider configuration from {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing provider configuration from {path}: {message}")]
    Parse { path: String, message: String },
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
