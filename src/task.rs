// src/task.rs
//! The message shared by Queuer and Worker, and its deterministic identity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::CallTemplate;

pub const KEY_SEPARATOR: char = '|';

/// One fetch unit for a single (provider, call type, symbol).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub provider: String,
    pub call_type: String,
    pub symbol: String,
    pub call_template: CallTemplate,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            provider: self.provider.clone(),
            call_type: self.call_type.clone(),
            symbol: self.symbol.clone(),
            function: self.call_template.function.clone(),
        }
    }

    pub fn dedup_key(&self) -> String {
        self.key().to_string()
    }
}

/// The dedup-key fields. Also stored as `lastQueuedItem` in the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKey {
    pub provider: String,
    pub call_type: String,
    pub symbol: String,
    pub function: String,
}

impl TaskKey {
    /// Queue batch-entry id: the queue only accepts `[A-Za-z0-9_-]`, so the
    /// separator-bearing key is hashed.
    pub fn entry_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(32);
        for b in digest.iter().take(16) {
            use std::fmt::Write as _;
            let _ = write!(&mut out, "{:02x}", b);
        }
        out
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{p}{s}{c}{s}{y}{s}{n}",
            p = self.provider,
            c = self.call_type,
            y = self.symbol,
            n = self.function,
            s = KEY_SEPARATOR
        )
    }
}
