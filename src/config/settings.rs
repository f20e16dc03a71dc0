// src/config/settings.rs
//! Tunable pipeline constants, read from the environment with defaults.

use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Hard ceiling of the queue's batch APIs.
pub const QUEUE_BATCH_MAX: usize = 10;
/// Hard ceiling on how far in the future the queue can delay a message.
pub const QUEUE_MAX_DELAY_SECS: u64 = 900;
/// Upper bound for concurrent external calls within one invocation.
pub const FAN_OUT_MAX: usize = 100;

pub const ENV_QUEUE_BATCH_MAX: &str = "DATASET_QUEUE_BATCH_MAX";
pub const ENV_MAX_SCHEDULE_DELAY_SECS: &str = "DATASET_MAX_SCHEDULE_DELAY_SECS";
pub const ENV_MIN_WAIT_SECS: &str = "DATASET_MIN_WAIT_SECS";
pub const ENV_GIVE_UP_AFTER: &str = "DATASET_GIVE_UP_AFTER";
pub const ENV_MAX_API_CALLS: &str = "DATASET_API_MAX_CALLS_PER_MINUTE";
pub const ENV_WORKER_FAN_OUT: &str = "DATASET_WORKER_FAN_OUT";
pub const ENV_DOWNLOAD_START_DATE: &str = "DATASET_API_DOWNLOAD_START_DATE";
pub const ENV_DOWNLOAD_END_DATE: &str = "DATASET_API_DOWNLOAD_END_DATE";
pub const ENV_QUEUE_VISIBILITY_SECS: &str = "DATASET_QUEUE_VISIBILITY_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Entries per send/receive/delete batch.
    pub queue_batch_max: usize,
    /// A bucket opening this many seconds (or more) from now is not scheduled
    /// in the current Queuer pass.
    pub max_schedule_delay_secs: u64,
    /// Floor for the recommended wait between Queuer passes.
    pub min_wait_secs: u64,
    /// Failed encounters tolerated before a task is dropped.
    pub give_up_after: u32,
    /// Default Worker call budget per invocation.
    pub max_api_calls: usize,
    /// Concurrent fetches per receive cycle.
    pub fan_out: usize,
    pub default_download_start: Option<String>,
    pub default_download_end: Option<String>,
    /// Visibility timeout of the in-process queue.
    pub queue_visibility: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_batch_max: QUEUE_BATCH_MAX,
            max_schedule_delay_secs: 60,
            min_wait_secs: 60,
            give_up_after: 3,
            max_api_calls: 100,
            fan_out: 10,
            default_download_start: None,
            default_download_end: None,
            queue_visibility: Duration::from_secs(30),
        }
    }
}

impl PipelineSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from an arbitrary key lookup. Unset keys keep their
    /// defaults; set-but-invalid keys are configuration errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |k: &'static str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let settings = Self {
            queue_batch_max: parse_or(&get, ENV_QUEUE_BATCH_MAX, d.queue_batch_max)?,
            max_schedule_delay_secs: parse_or(
                &get,
                ENV_MAX_SCHEDULE_DELAY_SECS,
                d.max_schedule_delay_secs,
            )?,
            min_wait_secs: parse_or(&get, ENV_MIN_WAIT_SECS, d.min_wait_secs)?,
            give_up_after: parse_or(&get, ENV_GIVE_UP_AFTER, d.give_up_after)?,
            max_api_calls: parse_or(&get, ENV_MAX_API_CALLS, d.max_api_calls)?,
            fan_out: parse_or(&get, ENV_WORKER_FAN_OUT, d.fan_out)?,
            default_download_start: get(ENV_DOWNLOAD_START_DATE),
            default_download_end: get(ENV_DOWNLOAD_END_DATE),
            queue_visibility: Duration::from_secs(parse_or(
                &get,
                ENV_QUEUE_VISIBILITY_SECS,
                d.queue_visibility.as_secs(),
            )?),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=QUEUE_BATCH_MAX).contains(&self.queue_batch_max) {
            return Err(invalid(ENV_QUEUE_BATCH_MAX, self.queue_batch_max));
        }
        if !(1..=QUEUE_MAX_DELAY_SECS).contains(&self.max_schedule_delay_secs) {
            return Err(invalid(
                ENV_MAX_SCHEDULE_DELAY_SECS,
                self.max_schedule_delay_secs,
            ));
        }
        if !(1..=FAN_OUT_MAX).contains(&self.fan_out) {
            return Err(invalid(ENV_WORKER_FAN_OUT, self.fan_out));
        }
        if self.max_api_calls == 0 {
            return Err(invalid(ENV_MAX_API_CALLS, self.max_api_calls));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    G: Fn(&'static str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| PipelineError::InvalidSetting {
            field: key,
            value: raw,
        }),
    }
}

fn invalid(field: &'static str, value: impl ToString) -> PipelineError {
    PipelineError::InvalidSetting {
        field,
        value: value.to_string(),
    }
}
