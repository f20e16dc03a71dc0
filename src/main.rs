//! Dataset pipeline: binary entrypoint.
//! Boots the Axum HTTP server the orchestrator calls: `/queuer`, `/worker`,
//! `/health` and `/metrics`.

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dataset_pipeline::{
    api::{self, AppState},
    fetch::{HttpFetcher, JsonFileSink},
    metrics::Metrics,
    queue::MemoryQueue,
    template::Secrets,
    PipelineSettings, ProviderSet, Queuer, Worker,
};

/// Compact logs by default, JSON with `LOG_FORMAT=json`. The deployment
/// runtime may already have installed a subscriber; that one wins.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("dataset_pipeline=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let res = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    if res.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = PipelineSettings::from_env().context("loading pipeline settings")?;
    let providers = Arc::new(ProviderSet::load_default().context("loading provider configuration")?);
    tracing::info!(
        providers = providers.all().len(),
        enabled = providers.enabled().count(),
        "provider configuration loaded"
    );

    let secrets = Secrets::from_env(providers.secret_names());
    let queue = Arc::new(MemoryQueue::new(settings.queue_visibility));
    let fetcher = Arc::new(HttpFetcher::new(secrets, JsonFileSink::from_env())?);

    let state = AppState {
        queuer: Arc::new(Queuer::new(providers, queue.clone(), settings.clone())),
        worker: Arc::new(Worker::new(queue, fetcher, settings)),
    };

    let metrics = Metrics::init()?;
    let router = api::router(state).merge(metrics.router());

    Ok(router.into())
}
