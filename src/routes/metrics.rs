use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;

/// Registers descriptions for every metric the batch core records.
pub fn describe_metrics() {
    ::metrics::describe_counter!("batch_jobs_submitted_total", "Batch jobs accepted");
    ::metrics::describe_counter!(
        "batch_jobs_finished_total",
        "Batch jobs that reached a terminal status, by status"
    );
    ::metrics::describe_counter!(
        "batch_items_processed_total",
        "Items that reached a terminal state, by outcome"
    );
    ::metrics::describe_counter!(
        "batch_item_attempts_total",
        "Attempts started, including retries"
    );
    ::metrics::describe_histogram!(
        "annotation_generation_seconds",
        "Latency of a single annotation provider call"
    );
    ::metrics::describe_histogram!(
        "rate_limiter_wait_seconds",
        "Time spent waiting for a rate-limit token"
    );
    ::metrics::describe_gauge!("batch_active_jobs", "Jobs not yet in a terminal status");
}

/// GET /metrics — Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}
