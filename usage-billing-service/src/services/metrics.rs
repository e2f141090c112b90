//! Prometheus metrics for usage-billing-service.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Billable event operations by event type and outcome.
pub static BILLABLE_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "usage_billing_billable_events_total",
        "Billable event ledger operations",
        &["operation", "outcome"] // create/confirm/fail/confirm_and_charge x applied/duplicate/...
    )
    .expect("Failed to register billable_events_total")
});

/// Guardrail decisions (allowed, consent_required, cap_exceeded).
pub static GUARDRAIL_DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "usage_billing_guardrail_decisions_total",
        "Spend guardrail decisions by outcome",
        &["outcome"]
    )
    .expect("Failed to register guardrail_decisions_total")
});

/// Quota limiter decisions, including fail-open.
pub static QUOTA_DECISIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "usage_billing_quota_decisions_total",
        "Generation attempt decisions by outcome",
        &["outcome"] // allowed, per_product_limit, per_session_limit, fail_open
    )
    .expect("Failed to register quota_decisions_total")
});

/// Serialization-conflict retries inside the quota limiter.
pub static QUOTA_RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "usage_billing_quota_retries_total",
        "Quota transactions retried after a serialization conflict",
        &["result"] // recovered, exhausted
    )
    .expect("Failed to register quota_retries_total")
});

/// Calls to the billing collaborator.
pub static COLLABORATOR_CALLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "usage_billing_collaborator_calls_total",
        "Billing collaborator calls by operation and status",
        &["operation", "status"]
    )
    .expect("Failed to register collaborator_calls_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "usage_billing_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Recorder behind the `metrics` facade used by the service-core HTTP
/// middleware. `None` if another global recorder was installed first.
static HTTP_METRICS: Lazy<Option<PrometheusHandle>> = Lazy::new(|| {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install HTTP metrics recorder");
            None
        }
    }
});

/// Initialize all metrics (forces lazy initialization). Safe to call more
/// than once.
pub fn init_metrics() {
    Lazy::force(&HTTP_METRICS);
    Lazy::force(&BILLABLE_EVENTS_TOTAL);
    Lazy::force(&GUARDRAIL_DECISIONS_TOTAL);
    Lazy::force(&QUOTA_DECISIONS_TOTAL);
    Lazy::force(&QUOTA_RETRIES_TOTAL);
    Lazy::force(&COLLABORATOR_CALLS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

pub fn record_billable_event(operation: &str, outcome: &str) {
    BILLABLE_EVENTS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn record_guardrail_decision(outcome: &str) {
    GUARDRAIL_DECISIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_quota_decision(outcome: &str) {
    QUOTA_DECISIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_quota_retry(result: &str) {
    QUOTA_RETRIES_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_collaborator_call(operation: &str, status: &str) {
    COLLABORATOR_CALLS_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

/// Get metrics in Prometheus text format: the service registry followed by
/// the HTTP request metrics.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut output = encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default();
    if let Some(handle) = HTTP_METRICS.as_ref() {
        output.push_str(&handle.render());
    }
    output
}
