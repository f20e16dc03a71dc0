// src/worker.rs
//! # Worker
//! Drains the queue under an invocation-local call budget. Each received task
//! is checked against its provider's forwarded rate limit, fetched with a
//! bounded fan-out, then acknowledged on success. Failures are counted per
//! task across invocations; a task that keeps failing is acknowledged and
//! dropped once the give-up threshold is reached.

use chrono::{DateTime, Duration, DurationRound, Utc};
use futures::stream::{self, StreamExt};
use metrics::counter;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::{DownloadWindow, PipelineSettings, RateLimit};
use crate::error::{PipelineError, Result};
use crate::fetch::{FetchOutcome, Fetcher};
use crate::metrics::ensure_described;
use crate::queue::{DeleteEntry, ReceivedMessage, TaskQueue};
use crate::schedule::minute_floor;
use crate::state::{PipelineState, WorkerStatus};
use crate::task::Task;

/// Consecutive empty receives that end an invocation.
const EMPTY_RECEIVES_TO_STOP: u32 = 2;

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Leave the message for redelivery; carries the failure count so far.
    Retry(u32),
    /// Acknowledge without success.
    GiveUp,
}

/// Count one failed encounter of `key`. A task is retried while it has
/// failed fewer than `give_up_after` times; the next failure gives up. The
/// entry is kept on give-up so a redelivery after a lost acknowledgement
/// gives up again at once; the caller forgets it once the delete is confirmed.
pub fn record_failure(
    failures: &mut BTreeMap<String, u32>,
    key: &str,
    give_up_after: u32,
) -> FailureVerdict {
    let count = failures.get(key).copied().unwrap_or(0);
    if count < give_up_after {
        failures.insert(key.to_string(), count + 1);
        FailureVerdict::Retry(count + 1)
    } else {
        FailureVerdict::GiveUp
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Window {
    start: Option<DateTime<Utc>>,
    calls: u32,
}

impl Window {
    fn roll(&mut self, start: DateTime<Utc>) {
        if self.start != Some(start) {
            self.start = Some(start);
            self.calls = 0;
        }
    }
}

/// Calls made per provider in the current minute and hour of this invocation.
#[derive(Debug, Default)]
struct CallLimiter {
    minute: HashMap<String, Window>,
    hour: HashMap<String, Window>,
}

impl CallLimiter {
    fn try_acquire(&mut self, provider: &str, limit: &RateLimit, now: DateTime<Utc>) -> bool {
        let minute = self.minute.entry(provider.to_string()).or_default();
        minute.roll(minute_floor(now));
        let hour = self.hour.entry(provider.to_string()).or_default();
        hour.roll(now.duration_trunc(Duration::hours(1)).unwrap_or(now));

        if minute.calls >= limit.per_minute {
            return false;
        }
        if limit.per_hour.is_some_and(|cap| hour.calls >= cap) {
            return false;
        }
        minute.calls += 1;
        hour.calls += 1;
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct CycleOutcome {
    /// Admitted plus unparseable messages.
    attempted: u64,
    acknowledged: u64,
    rate_limited: u64,
}

pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    fetcher: Arc<dyn Fetcher>,
    settings: PipelineSettings,
    clock: Clock,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        fetcher: Arc<dyn Fetcher>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            queue,
            fetcher,
            settings,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// One Worker invocation. Configuration problems are the only errors;
    /// queue and fetch failures are absorbed into the returned state.
    pub async fn run(&self, mut state: PipelineState) -> Result<PipelineState> {
        ensure_described();

        let today = (self.clock)().date_naive();
        let window = DownloadWindow::resolve(&state.options, &self.settings, today)?;
        let budget = state.max_api_calls.unwrap_or(self.settings.max_api_calls) as u64;
        if budget == 0 {
            return Err(PipelineError::InvalidSetting {
                field: "maxApiCalls",
                value: "0".into(),
            });
        }

        let mut limiter = CallLimiter::default();
        let mut worked = 0u64;
        let mut acknowledged = 0u64;
        let mut empty_receives = 0u32;

        let status = loop {
            if worked >= budget {
                break WorkerStatus::BudgetExhausted;
            }
            let want = (budget - worked).min(self.settings.queue_batch_max as u64) as usize;
            let messages = match self.queue.receive(want).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, queue = self.queue.name(), "receive failed");
                    counter!("queue_errors_total", "op" => "receive").increment(1);
                    Vec::new()
                }
            };

            if messages.is_empty() {
                empty_receives += 1;
                if empty_receives >= EMPTY_RECEIVES_TO_STOP {
                    break self.idle_status().await;
                }
                continue;
            }
            empty_receives = 0;
            counter!("worker_messages_received_total").increment(messages.len() as u64);

            let cycle = match self
                .process_batch(messages, &window, &mut limiter, &mut state)
                .await
            {
                Ok(cycle) => cycle,
                // Earlier cycles deleted messages; their counts must reach the orchestrator.
                Err(e) if acknowledged > 0 => {
                    tracing::error!(
                        error = %e,
                        acknowledged,
                        "configuration error after acknowledgements, stopping with progress"
                    );
                    break WorkerStatus::Misconfigured;
                }
                Err(e) => return Err(e),
            };
            worked += cycle.attempted;
            acknowledged += cycle.acknowledged;

            if cycle.attempted == 0 {
                tracing::info!(
                    rate_limited = cycle.rate_limited,
                    "every received task is over its rate limit"
                );
                break WorkerStatus::RateLimited;
            }
        };

        state.progress.items_processed += acknowledged;
        state.progress.worked_messages = worked;
        state.worker_status = Some(status);

        tracing::info!(
            status = ?status,
            worked_messages = worked,
            acknowledged,
            items_processed = state.progress.items_processed,
            items_queued = state.progress.items_queued,
            pending_failures = state.progress.failures.len(),
            "worker invocation finished"
        );
        Ok(state)
    }

    async fn idle_status(&self) -> WorkerStatus {
        match self.queue.approximate_depth().await {
            Ok(0) => WorkerStatus::Drained,
            Ok(depth) => {
                tracing::error!(
                    depth,
                    queue = self.queue.name(),
                    "queue reports visible messages but receives come back empty"
                );
                counter!("worker_stalled_total").increment(1);
                WorkerStatus::Stalled
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    queue = self.queue.name(),
                    "receives came back empty and the depth query failed"
                );
                counter!("queue_errors_total", "op" => "depth").increment(1);
                WorkerStatus::DepthUnknown
            }
        }
    }

    async fn process_batch(
        &self,
        messages: Vec<ReceivedMessage>,
        window: &DownloadWindow,
        limiter: &mut CallLimiter,
        state: &mut PipelineState,
    ) -> Result<CycleOutcome> {
        let mut parsed = Vec::with_capacity(messages.len());
        let mut unparseable = Vec::new();
        for m in messages {
            match serde_json::from_str::<Task>(&m.body) {
                Ok(task) => parsed.push((m, task)),
                Err(e) => {
                    tracing::warn!(error = %e, message_id = %m.message_id, "unparseable message");
                    unparseable.push(m);
                }
            }
        }

        // Missing limits are a configuration error; fail before any I/O.
        for (_, task) in &parsed {
            if !state.rate_limits.contains_key(&task.provider) {
                return Err(PipelineError::MissingRateLimit(task.provider.clone()));
            }
        }

        let mut out = CycleOutcome::default();
        let now = (self.clock)();
        let mut admitted = Vec::with_capacity(parsed.len());
        for (m, task) in parsed {
            let Some(limit) = state.rate_limits.get(&task.provider) else {
                continue;
            };
            if limiter.try_acquire(&task.provider, limit, now) {
                admitted.push((m, task));
            } else {
                tracing::debug!(provider = %task.provider, symbol = %task.symbol, "over rate limit, left in queue");
                out.rate_limited += 1;
            }
        }
        counter!("worker_rate_limited_total").increment(out.rate_limited);
        out.attempted = (admitted.len() + unparseable.len()) as u64;

        let fetcher = &self.fetcher;
        let results: Vec<(ReceivedMessage, Task, FetchOutcome)> = stream::iter(admitted)
            .map(|(m, task)| async move {
                let outcome = fetcher.process(&task, window).await;
                (m, task, outcome)
            })
            .buffer_unordered(self.settings.fan_out)
            .collect()
            .await;

        let give_up_after = self.settings.give_up_after;
        let failures = &mut state.progress.failures;
        let mut to_ack: Vec<DeleteEntry> = Vec::new();
        // message id -> failure key, forgotten once the delete is confirmed
        let mut given_up: HashMap<String, String> = HashMap::new();

        for m in &unparseable {
            if record_failure(failures, &m.message_id, give_up_after) == FailureVerdict::GiveUp {
                tracing::warn!(message_id = %m.message_id, "giving up on unparseable message");
                counter!("worker_tasks_abandoned_total").increment(1);
                given_up.insert(m.message_id.clone(), m.message_id.clone());
                to_ack.push(DeleteEntry::from(m));
            } else {
                counter!("worker_tasks_failed_total").increment(1);
            }
        }

        for (m, task, outcome) in &results {
            let key = task.dedup_key();
            if outcome.success {
                failures.remove(&key);
                counter!("worker_tasks_succeeded_total").increment(1);
                to_ack.push(DeleteEntry::from(m));
                continue;
            }
            match record_failure(failures, &key, give_up_after) {
                FailureVerdict::Retry(n) => {
                    tracing::warn!(dedup_key = %key, failures = n, "task failed, left for redelivery");
                    counter!("worker_tasks_failed_total").increment(1);
                }
                FailureVerdict::GiveUp => {
                    tracing::warn!(dedup_key = %key, receive_count = m.receive_count, "giving up on task");
                    counter!("worker_tasks_abandoned_total").increment(1);
                    given_up.insert(m.message_id.clone(), key.clone());
                    to_ack.push(DeleteEntry::from(m));
                }
            }
        }

        let confirmed = self.acknowledge(to_ack).await;
        for id in &confirmed {
            if let Some(key) = given_up.get(id) {
                failures.remove(key);
            }
        }
        out.acknowledged = confirmed.len() as u64;
        Ok(out)
    }

    /// Batch-delete acknowledged messages; returns the message ids the queue
    /// confirmed.
    async fn acknowledge(&self, entries: Vec<DeleteEntry>) -> Vec<String> {
        let mut confirmed = Vec::with_capacity(entries.len());
        for chunk in entries.chunks(self.settings.queue_batch_max) {
            match self.queue.delete_batch(chunk.to_vec()).await {
                Ok(outcome) => {
                    for f in &outcome.failed {
                        tracing::warn!(message_id = %f.id, reason = %f.reason, "acknowledgement rejected");
                    }
                    confirmed.extend(outcome.successful);
                }
                Err(e) => {
                    tracing::warn!(error = %e, entries = chunk.len(), "acknowledgement failed");
                    counter!("queue_errors_total", "op" => "delete").increment(1);
                }
            }
        }
        confirmed
    }
}
