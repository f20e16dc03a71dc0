// src/config/mod.rs
pub mod dates;
pub mod providers;
pub mod settings;

pub use dates::{DownloadOptions, DownloadWindow};
pub use providers::{CallConfig, CallTemplate, ProviderConfig, ProviderSet, RateLimit};
pub use settings::PipelineSettings;
