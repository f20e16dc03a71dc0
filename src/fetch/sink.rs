// src/fetch/sink.rs
//! Storage side of the fetch collaborator. Only the raw response is handed
//! over; normalisation belongs to whoever owns the time-series store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

use crate::task::Task;

pub const ENV_OUTPUT_DIR: &str = "DATASET_OUTPUT_DIR";
pub const DEFAULT_OUTPUT_DIR: &str = "data";

#[async_trait]
pub trait SeriesSink: Send + Sync {
    /// Persist one provider response; returns the number of records stored.
    async fn store(&self, task: &Task, body: Value) -> Result<usize>;
}

/// Writes raw bodies to `{root}/{provider}/{call_type}/{symbol}.json`.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    root: PathBuf,
}

impl JsonFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$DATASET_OUTPUT_DIR`, or `data` relative to the working dir.
    pub fn from_env() -> Self {
        let root = std::env::var(ENV_OUTPUT_DIR)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string());
        Self::new(root)
    }

    /// Path components are reduced to `[A-Za-z0-9_-]`, so `BRK.B` is stored
    /// as `BRK_B.json` and nothing escapes the root.
    pub fn path_for(&self, task: &Task) -> PathBuf {
        self.root
            .join(file_stem(&task.provider))
            .join(file_stem(&task.call_type))
            .join(format!("{}.json", file_stem(&task.symbol)))
    }
}

fn file_stem(raw: &str) -> String {
    let stem: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "_".to_string()
    } else {
        stem
    }
}

#[async_trait]
impl SeriesSink for JsonFileSink {
    async fn store(&self, task: &Task, body: Value) -> Result<usize> {
        let records = count_records(&body, &task.call_template.response.series_property);
        let path = self.path_for(task);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(&body).context("serializing response body")?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(records)
    }
}

/// Entries of the series in `body`. An empty `series_property` means the body
/// itself is the series; arrays of wrapper objects are summed.
pub fn count_records(body: &Value, series_property: &str) -> usize {
    match body {
        Value::Array(items) if !series_property.is_empty() => items
            .iter()
            .map(|item| count_records(item, series_property))
            .sum(),
        Value::Array(items) => items.len(),
        Value::Object(map) if !series_property.is_empty() => map
            .get(series_property)
            .map(|inner| count_records(inner, ""))
            .unwrap_or(0),
        Value::Object(map) => map.len(),
        _ => 0,
    }
}
