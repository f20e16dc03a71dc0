// src/queue/memory.rs
//! In-process queue with the semantics the pipeline relies on: per-message
//! delays, a visibility timeout with redelivery, a deduplication window and
//! batch limits. Backs the local binary and the tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::{
    BatchOutcome, DeleteEntry, EntryFailure, QueueError, ReceivedMessage, SendEntry, TaskQueue,
};
use crate::config::settings::{QUEUE_BATCH_MAX, QUEUE_MAX_DELAY_SECS};

const DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Debug)]
struct Stored {
    message_id: String,
    body: String,
    visible_at: Instant,
    receipt: Option<String>,
    receive_count: u32,
}

#[derive(Debug, Default)]
struct Inner {
    messages: Vec<Stored>,
    dedup: HashMap<String, Instant>,
    seq: u64,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{prefix}-{:08}", self.seq)
    }
}

#[derive(Debug)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    visibility_timeout: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            visibility_timeout,
        }
    }

    /// Stored messages, visible or not.
    pub fn len(&self) -> usize {
        self.lock().map(|g| g.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bodies of all stored messages in queue order.
    pub fn bodies(&self) -> Vec<String> {
        self.lock()
            .map(|g| g.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, QueueError> {
        self.inner
            .lock()
            .map_err(|_| QueueError::Unavailable("memory queue mutex poisoned".into()))
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<BatchOutcome, QueueError> {
        if entries.len() > QUEUE_BATCH_MAX {
            return Err(QueueError::BatchTooLarge(entries.len()));
        }
        let now = Instant::now();
        let mut inner = self.lock()?;
        inner
            .dedup
            .retain(|_, sent_at| now.duration_since(*sent_at) < DEDUP_WINDOW);

        let mut out = BatchOutcome::default();
        let mut ids = HashSet::new();
        for e in entries {
            if !ids.insert(e.id.clone()) {
                out.failed.push(EntryFailure {
                    id: e.id,
                    reason: "duplicate entry id in batch".into(),
                });
                continue;
            }
            if e.delay > Duration::from_secs(QUEUE_MAX_DELAY_SECS) {
                out.failed.push(EntryFailure {
                    id: e.id,
                    reason: format!("delay {}s exceeds {QUEUE_MAX_DELAY_SECS}s", e.delay.as_secs()),
                });
                continue;
            }
            if !inner.dedup.contains_key(&e.dedup_id) {
                inner.dedup.insert(e.dedup_id, now);
                let message_id = inner.next_id("m");
                inner.messages.push(Stored {
                    message_id,
                    body: e.body,
                    visible_at: now + e.delay,
                    receipt: None,
                    receive_count: 0,
                });
            }
            out.successful.push(e.id);
        }
        Ok(out)
    }

    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        if max_messages > QUEUE_BATCH_MAX {
            return Err(QueueError::BatchTooLarge(max_messages));
        }
        let now = Instant::now();
        let mut inner = self.lock()?;
        let visible: Vec<usize> = inner
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(i, _)| i)
            .take(max_messages)
            .collect();

        let mut out = Vec::with_capacity(visible.len());
        for i in visible {
            let receipt = inner.next_id("r");
            let m = &mut inner.messages[i];
            m.visible_at = now + self.visibility_timeout;
            m.receipt = Some(receipt.clone());
            m.receive_count += 1;
            out.push(ReceivedMessage {
                message_id: m.message_id.clone(),
                receipt_handle: receipt,
                body: m.body.clone(),
                receive_count: m.receive_count,
            });
        }
        Ok(out)
    }

    async fn delete_batch(&self, entries: Vec<DeleteEntry>) -> Result<BatchOutcome, QueueError> {
        if entries.len() > QUEUE_BATCH_MAX {
            return Err(QueueError::BatchTooLarge(entries.len()));
        }
        let mut inner = self.lock()?;
        let mut out = BatchOutcome::default();
        for e in entries {
            let pos = inner.messages.iter().position(|m| {
                m.message_id == e.id && m.receipt.as_deref() == Some(e.receipt_handle.as_str())
            });
            match pos {
                Some(i) => {
                    inner.messages.remove(i);
                    out.successful.push(e.id);
                }
                None => out.failed.push(EntryFailure {
                    id: e.id,
                    reason: "unknown message or stale receipt handle".into(),
                }),
            }
        }
        Ok(out)
    }

    async fn approximate_depth(&self) -> Result<usize, QueueError> {
        let now = Instant::now();
        let inner = self.lock()?;
        Ok(inner.messages.iter().filter(|m| m.visible_at <= now).count())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
