use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use shuttle_axum::axum::{routing::get, Router};
use tracing::warn;

/// Process-wide recorder; `None` when installation failed (another recorder won).
static METRICS: OnceCell<Option<Metrics>> = OnceCell::new();

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder once per process and publish the cache TTL gauge.
    /// Later calls reuse the first recorder and only refresh the gauge.
    pub fn global(ttl_ms: u64) -> Option<&'static Metrics> {
        let m = METRICS
            .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => {
                    describe();
                    Some(Metrics { handle })
                }
                Err(e) => {
                    warn!(target: "completeness", error = %e, "prometheus recorder not installed");
                    None
                }
            })
            .as_ref();

        // Absolute TTL, no sliding refresh
        gauge!("completeness_cache_ttl_ms").set(ttl_ms as f64);
        m
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

fn describe() {
    describe_counter!("completeness_cache_hits_total", "Results served from the cache.");
    describe_counter!(
        "completeness_cache_misses_total",
        "Requests that started a new computation."
    );
    describe_counter!(
        "completeness_cache_joined_total",
        "Requests that awaited an in-flight computation for the same input."
    );
    describe_counter!(
        "completeness_cache_store_errors_total",
        "Cache store failures or timeouts (fail-open)."
    );
    describe_counter!(
        "completeness_provider_unavailable_total",
        "Judgment calls that ended unavailable, by reason."
    );
    describe_counter!(
        "completeness_provider_retries_total",
        "Judgment attempts retried after a transient failure."
    );
    describe_histogram!(
        "completeness_analyze_duration_ms",
        "End-to-end analyze latency in milliseconds."
    );
    describe_gauge!("completeness_cache_ttl_ms", "Configured cache TTL in milliseconds.");
}
