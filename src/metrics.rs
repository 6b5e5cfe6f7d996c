//! Process-wide Prometheus metrics: a thin handle around the global
//! recorder, installed once at startup and rendered for the admin
//! `/metrics` endpoint.

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global recorder and register metric descriptions. Must
    /// be called once at startup before any `counter!`/`gauge!`/`histogram!`
    /// call elsewhere in the crate.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "snitcher_connections_total",
            Unit::Count,
            "Total client connections accepted"
        );
        describe_gauge!(
            "snitcher_connections_active",
            Unit::Count,
            "Number of connections currently being driven"
        );
        describe_counter!(
            "snitcher_flows_total",
            Unit::Count,
            "Total flows finalized, labeled by status"
        );
        describe_histogram!(
            "snitcher_dial_duration_seconds",
            Unit::Seconds,
            "Time spent dialing an upstream"
        );
        describe_histogram!(
            "snitcher_flow_duration_seconds",
            Unit::Seconds,
            "End-to-end flow duration from accept to finalize"
        );
        describe_counter!(
            "snitcher_leaf_mint_total",
            Unit::Count,
            "Total leaf certificate mint attempts, labeled by result"
        );
        describe_counter!(
            "snitcher_interceptor_failure_total",
            Unit::Count,
            "Total interceptor transforms that failed and were skipped"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
