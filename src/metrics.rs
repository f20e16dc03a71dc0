use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and register metric descriptions.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "queuer_tasks_emitted_total",
            "Tasks handed to the queue by the Queuer, per provider."
        );
        describe_counter!(
            "queuer_providers_deferred_total",
            "Providers whose enumeration stopped early at the scheduling ceiling."
        );
        describe_counter!(
            "queue_send_failures_total",
            "Send entries the queue rejected or never received."
        );
        describe_counter!(
            "queue_errors_total",
            "Whole-call queue failures, by operation."
        );
        describe_gauge!(
            "queuer_wait_seconds",
            "Recommended wait before the next Queuer pass."
        );
        describe_counter!(
            "worker_messages_received_total",
            "Messages received by the Worker."
        );
        describe_counter!("worker_tasks_succeeded_total", "Tasks fetched and stored.");
        describe_counter!(
            "worker_tasks_failed_total",
            "Failed task encounters left for redelivery."
        );
        describe_counter!(
            "worker_tasks_abandoned_total",
            "Tasks acknowledged without success after repeated failures."
        );
        describe_counter!(
            "worker_rate_limited_total",
            "Messages left in the queue because their provider was at its limit."
        );
        describe_counter!(
            "worker_stalled_total",
            "Worker invocations that found visible messages but could not receive them."
        );
        describe_histogram!("worker_fetch_ms", "Fetch-and-store time in milliseconds.");
    });
}
