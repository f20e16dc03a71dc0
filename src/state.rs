// src/state.rs
//! The state object the orchestrator threads through every invocation.
//!
//! It is the only memory the pipeline has: Queuer and Worker read it, mutate
//! it and hand it back. Field names follow the orchestrator's camelCase JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{DownloadOptions, ProviderSet, RateLimit};
use crate::schedule::CallCounts;
use crate::task::TaskKey;

/// Per-provider enumeration and rate-schedule progress of the Queuer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateScheduleCheckpoint {
    #[serde(default)]
    pub call_counts: BTreeMap<String, CallCounts>,
    #[serde(default)]
    pub delay_seconds: BTreeMap<String, u64>,
    /// Absent: never started. `false`: partially queued. `true`: done.
    #[serde(default)]
    pub queued_all_items: BTreeMap<String, bool>,
    #[serde(default)]
    pub last_queued_item: BTreeMap<String, TaskKey>,
}

impl RateScheduleCheckpoint {
    pub fn queued_all(&self, provider: &str) -> Option<bool> {
        self.queued_all_items.get(provider).copied()
    }

    /// Total calls scheduled for a provider across all buckets.
    pub fn scheduled_calls(&self, provider: &str) -> u64 {
        self.call_counts
            .get(provider)
            .map(|c| c.values().map(|&n| n as u64).sum())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerProgress {
    /// Tasks emitted by the latest Queuer pass.
    #[serde(default)]
    pub items_queued: u64,
    /// Tasks acknowledged since that pass, across Worker invocations.
    #[serde(default)]
    pub items_processed: u64,
    /// Messages handled by the latest Worker invocation.
    #[serde(default)]
    pub worked_messages: u64,
    /// Failed encounters per dedup key (or message id) still being retried.
    #[serde(default)]
    pub failures: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerStatus {
    /// Two empty receives and nothing visible left.
    Drained,
    /// The invocation call budget was used up.
    BudgetExhausted,
    /// Every message of a receive cycle was over its provider's rate limit.
    RateLimited,
    /// Two empty receives while the queue still reports visible messages.
    Stalled,
    /// Two empty receives and the depth query failed; drained or stalled is
    /// unknown.
    DepthUnknown,
    /// A configuration error hit after earlier cycles were acknowledged. The
    /// offending messages stay queued; the next invocation reports the error.
    Misconfigured,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    #[serde(default)]
    pub skip_queueing: bool,
    #[serde(default)]
    pub options: DownloadOptions,
    /// Overrides the configured Worker call budget for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_api_calls: Option<usize>,
    #[serde(flatten)]
    pub checkpoint: RateScheduleCheckpoint,
    /// Forwarded from the Queuer to the Worker.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimit>,
    #[serde(flatten)]
    pub progress: WorkerProgress,
    #[serde(default)]
    pub wait_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_status: Option<WorkerStatus>,
}

impl PipelineState {
    /// Every task of the current checkpoint generation was acknowledged.
    pub fn drain_complete(&self) -> bool {
        self.progress.items_processed >= self.progress.items_queued
    }

    /// Some provider was only partially enumerated and needs another pass.
    pub fn needs_requeue(&self) -> bool {
        self.checkpoint.queued_all_items.values().any(|done| !done)
    }

    pub fn is_stalled(&self) -> bool {
        self.worker_status == Some(WorkerStatus::Stalled)
    }

    /// All enabled providers fully enumerated and the queue drained.
    pub fn pipeline_complete(&self, providers: &ProviderSet) -> bool {
        providers
            .enabled()
            .all(|p| self.checkpoint.queued_all(&p.provider) == Some(true))
            && self.drain_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_object_is_a_fresh_state() {
        let s: PipelineState = serde_json::from_str("{}").unwrap();
        assert_eq!(s, PipelineState::default());
        assert!(s.drain_complete());
        assert!(!s.needs_requeue());
    }

    #[test]
    fn flat_orchestrator_json_round_trips() {
        let raw = json!({
            "skipQueueing": false,
            "options": { "downloadStartDate": "2010-01-01", "downloadEndDate": "0d" },
            "callCounts": { "alphavantage": { "2024-05-06T12:00": 5 } },
            "delaySeconds": { "alphavantage": 60 },
            "queuedAllItems": { "alphavantage": false, "tiingo": true },
            "lastQueuedItem": {
                "alphavantage": {
                    "provider": "alphavantage",
                    "callType": "stocks",
                    "symbol": "VOO",
                    "function": "TIME_SERIES_DAILY_ADJUSTED"
                }
            },
            "rateLimits": { "alphavantage": { "perMinute": 5 } },
            "itemsQueued": 5,
            "itemsProcessed": 2,
            "workedMessages": 2,
            "failures": { "alphavantage|stocks|BIV|TIME_SERIES_DAILY_ADJUSTED": 1 },
            "waitSeconds": 60
        });
        let s: PipelineState = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(s.checkpoint.queued_all("alphavantage"), Some(false));
        assert_eq!(s.checkpoint.queued_all("tiingo"), Some(true));
        assert_eq!(s.checkpoint.queued_all("other"), None);
        assert_eq!(s.checkpoint.scheduled_calls("alphavantage"), 5);
        assert_eq!(s.progress.items_processed, 2);
        assert!(s.needs_requeue());
        assert!(!s.drain_complete());

        let back = serde_json::to_value(&s).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn worker_status_serializes_camel_case() {
        let s = PipelineState {
            worker_status: Some(WorkerStatus::BudgetExhausted),
            ..PipelineState::default()
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["workerStatus"], "budgetExhausted");
    }
}
