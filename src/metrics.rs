// src/metrics.rs
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "been_fetch_errors_total",
            "Source fetches that failed; the cursor stays put."
        );
        describe_counter!(
            "been_events_stored_total",
            "Event records written by update cycles."
        );
        describe_counter!(
            "been_store_conflicts_total",
            "Revision conflicts seen by the retrying writer."
        );
        describe_counter!("been_update_runs_total", "Completed update cycles.");
        describe_histogram!("been_fetch_ms", "Source fetch time in milliseconds.");
        describe_histogram!("been_feed_parse_ms", "Feed document parse time in milliseconds.");
        describe_gauge!(
            "been_last_update_ts",
            "Unix ts when an update cycle last finished."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Only one recorder can exist per process.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        ensure_metrics_described();
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
