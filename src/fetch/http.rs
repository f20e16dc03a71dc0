// src/fetch/http.rs
//! HTTP adapter: resolve the task's call template, GET it with `reqwest` and
//! hand the JSON body to a [`SeriesSink`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use metrics::histogram;
use serde_json::Value;
use std::time::{Duration, Instant};

use super::{FetchOutcome, Fetcher, SeriesSink};
use crate::config::DownloadWindow;
use crate::task::Task;
use crate::template::{self, Bindings, Secrets};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Top-level keys providers use to report errors with a 200 status.
const ERROR_KEYS: [&str; 3] = ["Error Message", "Note", "Information"];

pub struct HttpFetcher<S> {
    client: reqwest::Client,
    secrets: Secrets,
    sink: S,
}

impl<S: SeriesSink> HttpFetcher<S> {
    pub fn new(secrets: Secrets, sink: S) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("dataset-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            secrets,
            sink,
        })
    }

    async fn fetch_and_store(&self, task: &Task, window: &DownloadWindow) -> Result<usize> {
        let bindings = Bindings {
            symbol: &task.symbol,
            function: &task.call_template.function,
            start_date: window.start,
            end_date: window.end,
            secrets: &self.secrets,
        };
        let req = template::resolve(&task.call_template, &bindings)?;

        let mut builder = self.client.get(&req.url).query(&req.query);
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let body: Value = builder
            .send()
            .await
            .context("sending request")?
            .error_for_status()
            .context("provider returned an error status")?
            .json()
            .await
            .context("decoding provider response")?;

        if let Some(key) = provider_error(&body) {
            bail!("provider reported {key:?} in the response body");
        }
        self.sink.store(task, body).await
    }
}

fn provider_error(body: &Value) -> Option<&'static str> {
    let map = body.as_object()?;
    ERROR_KEYS.into_iter().find(|k| map.contains_key(*k))
}

#[async_trait]
impl<S: SeriesSink> Fetcher for HttpFetcher<S> {
    async fn process(&self, task: &Task, window: &DownloadWindow) -> FetchOutcome {
        let t0 = Instant::now();
        let out = self.fetch_and_store(task, window).await;
        histogram!("worker_fetch_ms").record(t0.elapsed().as_secs_f64() * 1000.0);

        match out {
            Ok(records) => {
                tracing::debug!(
                    provider = %task.provider,
                    call_type = %task.call_type,
                    symbol = %task.symbol,
                    records,
                    "stored series"
                );
                FetchOutcome::stored(records)
            }
            Err(e) => {
                tracing::warn!(
                    error = ?e,
                    provider = %task.provider,
                    call_type = %task.call_type,
                    symbol = %task.symbol,
                    "fetch failed"
                );
                FetchOutcome::failed()
            }
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
