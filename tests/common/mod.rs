// tests/common/mod.rs
//
// Shared fixtures and test doubles for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use dataset_pipeline::config::{DownloadOptions, DownloadWindow, ProviderConfig};
use dataset_pipeline::fetch::{FetchOutcome, Fetcher};
use dataset_pipeline::queue::{
    BatchOutcome, DeleteEntry, EntryFailure, MemoryQueue, QueueError, ReceivedMessage, SendEntry,
    TaskQueue,
};
use dataset_pipeline::task::Task;
use dataset_pipeline::worker::Clock;
use dataset_pipeline::PipelineSettings;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
}

pub fn symbols(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}{i:04}")).collect()
}

/// A provider with one `stocks` call type.
pub fn provider(name: &str, per_minute: u32, symbols: &[String]) -> ProviderConfig {
    provider_with_calls(name, per_minute, &[("stocks", symbols)])
}

pub fn provider_with_calls(
    name: &str,
    per_minute: u32,
    calls: &[(&str, &[String])],
) -> ProviderConfig {
    let calls: serde_json::Map<String, serde_json::Value> = calls
        .iter()
        .map(|(call_type, symbols)| {
            (
                call_type.to_string(),
                json!({
                    "url": "https://example.test/${symbol}",
                    "function": format!("{call_type}-fn"),
                    "parameters": { "from": "${startDate}", "to": "${endDate}" },
                    "response": { "order": "asc", "array": true, "dateProperty": "date", "valueProperty": "close" },
                    "symbols": symbols
                }),
            )
        })
        .collect();
    serde_json::from_value(json!({
        "provider": name,
        "rateLimit": { "perMinute": per_minute },
        "calls": calls
    }))
    .unwrap()
}

pub fn settings() -> PipelineSettings {
    PipelineSettings {
        default_download_start: Some("2020-01-01".into()),
        default_download_end: Some("0d".into()),
        ..PipelineSettings::default()
    }
}

pub fn options() -> DownloadOptions {
    DownloadOptions {
        download_start_date: Some("2020-01-01".into()),
        download_end_date: Some("2020-12-31".into()),
    }
}

/// A chrono clock the test moves by hand.
#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<DateTime<Utc>>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }

    pub fn advance_secs(&self, secs: i64) {
        *self.0.lock() += chrono::Duration::seconds(secs);
    }

    pub fn clock(&self) -> Clock {
        let inner = self.0.clone();
        Arc::new(move || *inner.lock())
    }
}

/// Fetcher double: succeeds unless told otherwise, records every call.
#[derive(Default)]
pub struct ScriptedFetcher {
    calls: Mutex<Vec<String>>,
    always_fail: Mutex<HashSet<String>>,
    fail_times: Mutex<HashMap<String, u32>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every fetch of `symbol` fails.
    pub fn fail_always(&self, symbol: &str) {
        self.always_fail.lock().insert(symbol.to_string());
    }

    /// The next `times` fetches of `symbol` fail.
    pub fn fail_times(&self, symbol: &str, times: u32) {
        self.fail_times.lock().insert(symbol.to_string(), times);
    }

    /// Dedup keys in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn process(&self, task: &Task, _window: &DownloadWindow) -> FetchOutcome {
        self.calls.lock().push(task.dedup_key());
        if self.always_fail.lock().contains(&task.symbol) {
            return FetchOutcome::failed();
        }
        let mut scripted = self.fail_times.lock();
        if let Some(left) = scripted.get_mut(&task.symbol) {
            if *left > 0 {
                *left -= 1;
                return FetchOutcome::failed();
            }
        }
        FetchOutcome::stored(1)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Queue double that records sends and can be told to fail them.
#[derive(Default)]
pub struct RecordingQueue {
    pub sent: Mutex<Vec<SendEntry>>,
    pub batch_sizes: Mutex<Vec<usize>>,
    pub fail_sends: bool,
    /// Depth reported while receives come back empty.
    pub stuck_depth: usize,
}

impl RecordingQueue {
    pub fn failing() -> Self {
        Self {
            fail_sends: true,
            ..Self::default()
        }
    }

    pub fn stuck(depth: usize) -> Self {
        Self {
            stuck_depth: depth,
            ..Self::default()
        }
    }

    pub fn sent_keys(&self) -> Vec<String> {
        self.sent.lock().iter().map(|e| e.dedup_id.clone()).collect()
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<BatchOutcome, QueueError> {
        self.batch_sizes.lock().push(entries.len());
        if self.fail_sends {
            return Err(QueueError::Unavailable("send refused".into()));
        }
        let ids = entries.iter().map(|e| e.id.clone()).collect();
        self.sent.lock().extend(entries);
        Ok(BatchOutcome {
            successful: ids,
            failed: Vec::new(),
        })
    }

    async fn receive(&self, _max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        Ok(Vec::new())
    }

    async fn delete_batch(&self, entries: Vec<DeleteEntry>) -> Result<BatchOutcome, QueueError> {
        Ok(BatchOutcome {
            successful: entries.into_iter().map(|e| e.id).collect(),
            failed: Vec::new(),
        })
    }

    async fn approximate_depth(&self) -> Result<usize, QueueError> {
        Ok(self.stuck_depth)
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// In-process queue whose receive, delete and depth calls can be made to fail.
pub struct FlakyQueue {
    pub inner: MemoryQueue,
    receive_errors: AtomicU32,
    delete_errors: AtomicBool,
    delete_rejects: AtomicBool,
    depth_errors: AtomicBool,
}

impl FlakyQueue {
    pub fn new(inner: MemoryQueue) -> Self {
        Self {
            inner,
            receive_errors: AtomicU32::new(0),
            delete_errors: AtomicBool::new(false),
            delete_rejects: AtomicBool::new(false),
            depth_errors: AtomicBool::new(false),
        }
    }

    /// The next `n` receives fail as a whole.
    pub fn fail_receives(&self, n: u32) {
        self.receive_errors.store(n, Ordering::SeqCst);
    }

    /// Delete calls fail as a whole.
    pub fn fail_deletes(&self, on: bool) {
        self.delete_errors.store(on, Ordering::SeqCst);
    }

    /// Delete calls succeed but report every entry as failed.
    pub fn reject_deletes(&self, on: bool) {
        self.delete_rejects.store(on, Ordering::SeqCst);
    }

    pub fn fail_depth(&self, on: bool) {
        self.depth_errors.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskQueue for FlakyQueue {
    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<BatchOutcome, QueueError> {
        self.inner.send_batch(entries).await
    }

    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let failing = self
            .receive_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::Unavailable("receive refused".into()));
        }
        self.inner.receive(max).await
    }

    async fn delete_batch(&self, entries: Vec<DeleteEntry>) -> Result<BatchOutcome, QueueError> {
        if self.delete_errors.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("delete refused".into()));
        }
        if self.delete_rejects.load(Ordering::SeqCst) {
            return Ok(BatchOutcome {
                successful: Vec::new(),
                failed: entries
                    .into_iter()
                    .map(|e| EntryFailure {
                        id: e.id,
                        reason: "receipt handle expired".into(),
                    })
                    .collect(),
            });
        }
        self.inner.delete_batch(entries).await
    }

    async fn approximate_depth(&self) -> Result<usize, QueueError> {
        if self.depth_errors.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("depth unavailable".into()));
        }
        self.inner.approximate_depth().await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Enqueue tasks with no delay, ten per batch.
pub async fn seed(queue: &dyn TaskQueue, tasks: impl IntoIterator<Item = Task>) {
    let entries: Vec<SendEntry> = tasks
        .into_iter()
        .map(|t| SendEntry {
            id: t.key().entry_id(),
            body: serde_json::to_string(&t).unwrap(),
            dedup_id: t.dedup_key(),
            delay: std::time::Duration::ZERO,
        })
        .collect();
    for chunk in entries.chunks(10) {
        let out = queue.send_batch(chunk.to_vec()).await.unwrap();
        assert!(out.failed.is_empty());
    }
}
