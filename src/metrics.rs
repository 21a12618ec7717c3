// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::config::AppConfig;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder once per process and publish static
    /// gauges from the loaded config. Later calls reuse the first handle.
    pub fn init(cfg: &AppConfig) -> anyhow::Result<Self> {
        let handle = HANDLE
            .get_or_try_init(|| {
                let handle = PrometheusBuilder::new().install_recorder()?;
                describe();
                Ok::<_, anyhow::Error>(handle)
            })?
            .clone();

        for p in &cfg.providers {
            gauge!("quota_daily_cap", "provider" => p.id.clone()).set(p.daily_cap as f64);
        }
        gauge!("dedup_threshold").set(cfg.dedup.threshold);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
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

fn describe() {
    describe_counter!("provider_calls_total", "Provider calls by outcome");
    describe_counter!("provider_degraded_total", "Providers put into cool-down");
    describe_histogram!("provider_call_ms", "Upstream call latency in milliseconds");
    describe_counter!("quota_denied_total", "Admissions denied by the quota ledger");
    describe_counter!("quota_committed_total", "Quota units consumed");
    describe_gauge!("quota_usage_ratio", "max(daily, hourly) usage per provider");
    describe_counter!("quota_flush_failures_total", "Counter persistence failures");
    describe_counter!("dedup_removed_total", "Articles dropped as near-duplicates");
    describe_counter!("dedup_ambiguous_total", "Near-threshold pairs kept");
    describe_counter!("cache_requests_total", "Cache lookups by status");
    describe_counter!("cache_store_errors_total", "Cache backend failures");
    describe_counter!("cache_invalidations_total", "Explicit cache invalidations");
    describe_counter!("article_store_errors_total", "Article store write failures");
    describe_gauge!("quota_daily_cap", "Configured daily cap per provider");
    describe_gauge!("dedup_threshold", "Configured near-duplicate threshold");
    describe_counter!("aggregate_runs_total", "Aggregation runs by outcome");
    describe_gauge!("aggregate_last_run_ts", "Unix time of the last successful aggregation");
    describe_histogram!("aggregate_ms", "Aggregation wall time in milliseconds");
    describe_counter!("scheduler_refresh_total", "Background refreshes by outcome");
    describe_gauge!("scheduler_last_refresh_ts", "Unix time of the last refresh pass");
}
