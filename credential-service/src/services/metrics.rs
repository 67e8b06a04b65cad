//! Prometheus metrics for credential-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// gRPC request counter by method and status.
pub static GRPC_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credential_grpc_requests_total",
        "Total number of gRPC requests",
        &["method", "status"]
    )
    .expect("Failed to register grpc_requests_total")
});

/// gRPC request duration histogram by method.
pub static GRPC_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "credential_grpc_request_duration_seconds",
        "gRPC request duration in seconds",
        &["method"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register grpc_request_duration")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "credential_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Rotation attempts, one per tier processed.
pub static ROTATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credential_rotations_total",
        "Total number of credential rotation attempts",
        &["provider", "tier", "rotation_type", "status"]
    )
    .expect("Failed to register rotations_total")
});

/// Cost events recorded into the spending ledger.
pub static SPEND_RECORDED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credential_spend_recorded_total",
        "Total number of cost events recorded",
        &["category"]
    )
    .expect("Failed to register spend_recorded_total")
});

/// More than one active credential found for a (provider, tier).
pub static INTEGRITY_VIOLATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "credential_integrity_violations_total",
        "Reads that found more than one active credential for a provider and tier",
        &["provider", "tier"]
    )
    .expect("Failed to register integrity_violations_total")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&GRPC_REQUESTS_TOTAL);
    Lazy::force(&GRPC_REQUEST_DURATION);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&ROTATIONS_TOTAL);
    Lazy::force(&SPEND_RECORDED_TOTAL);
    Lazy::force(&INTEGRITY_VIOLATIONS_TOTAL);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
