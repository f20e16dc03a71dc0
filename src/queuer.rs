// src/queuer.rs
//! # Queuer
//! Enumerates provider × call type × symbol, schedules each task into a
//! minute bucket its provider can absorb and sends it to the queue with the
//! matching delay. When a provider's next free bucket lies beyond the
//! scheduling ceiling the pass stops for that provider and records where to
//! resume.

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PipelineSettings, ProviderConfig, ProviderSet};
use crate::metrics::ensure_described;
use crate::queue::{SendEntry, TaskQueue};
use crate::schedule::{admit, Admission, ScheduleCursor};
use crate::state::PipelineState;
use crate::task::{Task, TaskKey};

pub struct Queuer {
    providers: Arc<ProviderSet>,
    queue: Arc<dyn TaskQueue>,
    settings: PipelineSettings,
}

impl Queuer {
    pub fn new(
        providers: Arc<ProviderSet>,
        queue: Arc<dyn TaskQueue>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            providers,
            queue,
            settings,
        }
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    /// One Queuer invocation. Never fails: queue errors are logged and the
    /// checkpoint advances on constructed tasks.
    pub async fn run(&self, mut state: PipelineState, now: DateTime<Utc>) -> PipelineState {
        ensure_described();

        if state.skip_queueing {
            tracing::info!("skipQueueing set, nothing queued");
            state.progress.items_queued = 0;
            state.wait_seconds = 0;
            return state;
        }

        let batch_max = self.settings.queue_batch_max;
        let mut batch: Vec<SendEntry> = Vec::with_capacity(batch_max);
        let mut emitted_total = 0u64;
        let mut max_delay = 0u64;

        for provider in self.providers.enabled() {
            let name = provider.provider.as_str();
            let start = match state.checkpoint.queued_all(name) {
                Some(true) => {
                    tracing::debug!(provider = name, "already fully queued");
                    continue;
                }
                Some(false) => resume_index(provider, state.checkpoint.last_queued_item.get(name)),
                None => 0,
            };

            let counts = state
                .checkpoint
                .call_counts
                .entry(name.to_string())
                .or_default();
            let mut cursor = ScheduleCursor::resume(counts, now);
            let mut emitted = 0u64;
            let mut last: Option<TaskKey> = None;
            let mut deferred: Option<u64> = None;

            for task in provider.tasks().skip(start) {
                let delay_secs = match admit(
                    provider.rate_limit.per_minute,
                    counts,
                    &mut cursor,
                    now,
                    self.settings.max_schedule_delay_secs,
                ) {
                    Admission::Admitted { delay_secs } => delay_secs,
                    Admission::Deferred { delay_secs } => {
                        deferred = Some(delay_secs);
                        break;
                    }
                };

                let entry = match send_entry(&task, delay_secs) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::error!(error = ?e, dedup_key = %task.dedup_key(), "task not serializable");
                        continue;
                    }
                };
                batch.push(entry);
                last = Some(task.key());
                emitted += 1;

                if batch.len() >= batch_max {
                    self.flush(&mut batch).await;
                }
            }

            counter!("queuer_tasks_emitted_total", "provider" => name.to_string()).increment(emitted);
            emitted_total += emitted;

            let cp = &mut state.checkpoint;
            match deferred {
                Some(delay) => {
                    cp.queued_all_items.insert(name.to_string(), false);
                    // Nothing emitted this pass keeps the previous resume point.
                    if let Some(key) = last {
                        cp.last_queued_item.insert(name.to_string(), key);
                    }
                    cp.delay_seconds.insert(name.to_string(), delay);
                    max_delay = max_delay.max(delay);
                    counter!("queuer_providers_deferred_total").increment(1);
                    tracing::info!(
                        provider = name,
                        emitted,
                        delay_secs = delay,
                        "rate schedule full, provider deferred"
                    );
                }
                None => {
                    cp.queued_all_items.insert(name.to_string(), true);
                    cp.last_queued_item.remove(name);
                    cp.delay_seconds.insert(name.to_string(), 0);
                    tracing::info!(provider = name, emitted, "provider fully queued");
                }
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }

        state.progress.items_queued = emitted_total;
        state.progress.items_processed = 0;
        state.progress.worked_messages = 0;
        state.rate_limits = self.providers.rate_limits();
        state.wait_seconds = wait_seconds(max_delay, self.settings.min_wait_secs);
        state.worker_status = None;
        gauge!("queuer_wait_seconds").set(state.wait_seconds as f64);

        tracing::info!(
            items_queued = emitted_total,
            wait_seconds = state.wait_seconds,
            "queuer pass finished"
        );
        state
    }

    async fn flush(&self, batch: &mut Vec<SendEntry>) {
        let entries = std::mem::take(batch);
        let n = entries.len();
        match self.queue.send_batch(entries).await {
            Ok(outcome) => {
                for f in &outcome.failed {
                    tracing::warn!(entry_id = %f.id, reason = %f.reason, "queue rejected entry");
                }
                counter!("queue_send_failures_total").increment(outcome.failed.len() as u64);
                tracing::debug!(sent = outcome.successful.len(), queue = self.queue.name(), "batch sent");
            }
            Err(e) => {
                tracing::error!(error = %e, entries = n, queue = self.queue.name(), "batch send failed");
                counter!("queue_errors_total", "op" => "send").increment(1);
                counter!("queue_send_failures_total").increment(n as u64);
            }
        }
    }
}

/// Index of the first task after `last`, or 0 when there is nothing to
/// resume from.
fn resume_index(provider: &ProviderConfig, last: Option<&TaskKey>) -> usize {
    let Some(last) = last else {
        tracing::warn!(
            provider = %provider.provider,
            "partially queued without a resume point, starting over"
        );
        return 0;
    };
    match provider.tasks().position(|t| &t.key() == last) {
        Some(i) => i + 1,
        None => {
            tracing::warn!(
                provider = %provider.provider,
                last = %last,
                "resume point no longer configured, starting over"
            );
            0
        }
    }
}

fn send_entry(task: &Task, delay_secs: u64) -> serde_json::Result<SendEntry> {
    let key = task.key();
    Ok(SendEntry {
        id: key.entry_id(),
        body: serde_json::to_string(task)?,
        dedup_id: key.to_string(),
        delay: Duration::from_secs(delay_secs),
    })
}

/// Half the longest provider delay, floored to whole minutes, never below
/// `min_wait`.
pub fn wait_seconds(max_provider_delay: u64, min_wait: u64) -> u64 {
    (max_provider_delay / 2 / 60 * 60).max(min_wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider(symbols: &[&str]) -> ProviderConfig {
        serde_json::from_value(json!({
            "provider": "tiingo",
            "rateLimit": { "perMinute": 500 },
            "calls": {
                "stocks": {
                    "url": "https://example.test/${symbol}",
                    "function": "eod",
                    "response": { "order": "asc", "dateProperty": "date", "valueProperty": "close" },
                    "symbols": symbols
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn wait_is_half_the_delay_in_whole_minutes() {
        assert_eq!(wait_seconds(0, 60), 60);
        assert_eq!(wait_seconds(60, 60), 60);
        assert_eq!(wait_seconds(600, 60), 300);
        assert_eq!(wait_seconds(659, 60), 300);
        assert_eq!(wait_seconds(900, 0), 420);
    }

    #[test]
    fn resume_index_starts_after_the_last_key() {
        let p = provider(&["A", "B", "C"]);
        let b = p.tasks().nth(1).unwrap().key();
        assert_eq!(resume_index(&p, Some(&b)), 2);
        assert_eq!(resume_index(&p, None), 0);

        let gone = TaskKey {
            symbol: "Z".into(),
            ..b
        };
        assert_eq!(resume_index(&p, Some(&gone)), 0);
    }

    #[test]
    fn send_entry_carries_key_body_and_delay() {
        let p = provider(&["VOO"]);
        let task = p.tasks().next().unwrap();
        let e = send_entry(&task, 42).unwrap();
        assert_eq!(e.dedup_id, "tiingo|stocks|VOO|eod");
        assert_eq!(e.id, task.key().entry_id());
        assert_eq!(e.delay, Duration::from_secs(42));
        let back: Task = serde_json::from_str(&e.body).unwrap();
        assert_eq!(back, task);
    }
}
