// src/queue/mod.rs
//! Durable at-least-once queue interface used by Queuer and Worker.
//!
//! Batch calls report per-entry outcomes; a whole-call failure is a
//! [`QueueError`]. Neither aborts an invocation: callers log and move on.

pub mod memory;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("batch of {0} entries exceeds the queue batch limit")]
    BatchTooLarge(usize),
    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEntry {
    /// Unique within the batch.
    pub id: String,
    pub body: String,
    /// Idempotency key: a repeat inside the dedup window is accepted but not
    /// enqueued again.
    pub dedup_id: String,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<EntryFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// How many times this message has been handed out, this one included.
    pub receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_handle: String,
}

impl From<&ReceivedMessage> for DeleteEntry {
    fn from(m: &ReceivedMessage) -> Self {
        Self {
            id: m.message_id.clone(),
            receipt_handle: m.receipt_handle.clone(),
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn send_batch(&self, entries: Vec<SendEntry>) -> Result<BatchOutcome, QueueError>;
    async fn receive(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError>;
    async fn delete_batch(&self, entries: Vec<DeleteEntry>) -> Result<BatchOutcome, QueueError>;
    /// Visible messages, as far as the queue can tell.
    async fn approximate_depth(&self) -> Result<usize, QueueError>;
    fn name(&self) -> &'static str;
}
