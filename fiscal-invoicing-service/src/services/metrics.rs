//! Prometheus metrics for fiscal-invoicing-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for invoice submissions by outcome.
pub static SUBMISSIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fiscal_invoicing_submissions_total",
        "Total number of invoice submissions",
        &["outcome"]
    )
    .expect("Failed to register SUBMISSIONS")
});

/// Histogram for provider request duration by action.
pub static PROVIDER_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fiscal_invoicing_provider_request_duration_seconds",
        "Provider request duration in seconds, retries included",
        &["action", "outcome"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("Failed to register PROVIDER_REQUEST_DURATION")
});

/// Counter for provider callbacks by acknowledgement.
pub static CALLBACKS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fiscal_invoicing_callbacks_total",
        "Total number of provider callbacks",
        &["status"]
    )
    .expect("Failed to register CALLBACKS")
});

/// Histogram for database query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "fiscal_invoicing_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for platform webhooks by topic.
pub static WEBHOOKS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fiscal_invoicing_webhooks_total",
        "Total number of platform webhooks received",
        &["topic"]
    )
    .expect("Failed to register WEBHOOKS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "fiscal_invoicing_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&SUBMISSIONS);
    Lazy::force(&PROVIDER_REQUEST_DURATION);
    Lazy::force(&CALLBACKS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&WEBHOOKS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_submission(outcome: &str) {
    SUBMISSIONS.with_label_values(&[outcome]).inc();
}

pub fn record_provider_request(action: &str, outcome: &str, duration_secs: f64) {
    PROVIDER_REQUEST_DURATION
        .with_label_values(&[action, outcome])
        .observe(duration_secs);
}

pub fn record_callback(status: &str) {
    CALLBACKS.with_label_values(&[status]).inc();
}

pub fn record_webhook(topic: &str) {
    WEBHOOKS.with_label_values(&[topic]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
