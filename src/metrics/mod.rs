//! Metrics module
//!
//! Prometheus metrics for client-side uploads. Callers expose them through
//! the default registry with [`gather`].

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "uploadr_uploads_total",
        "Total number of uploads",
        &["method", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: CounterVec = register_counter_vec!(
        "uploadr_upload_bytes_total",
        "Total bytes acknowledged by servers",
        &["method"]
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "uploadr_upload_duration_seconds",
        "Upload duration in seconds",
        &["method"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    ).unwrap();

    // Chunk metrics
    pub static ref CHUNKS_TOTAL: CounterVec = register_counter_vec!(
        "uploadr_chunks_total",
        "Chunk requests by outcome",
        &["method", "status"]
    ).unwrap();

    // Retry metrics
    pub static ref RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "uploadr_retries_total",
        "Retried requests",
        &["operation"]
    ).unwrap();
}

/// Record a finished upload
pub fn record_upload_success(method: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[method, "success"]).inc();
    UPLOAD_BYTES_TOTAL
        .with_label_values(&[method])
        .inc_by(bytes as f64);
}

/// Record a failed upload; aborts and timeouts are labelled separately
pub fn record_upload_failure(method: &str, cancelled: bool) {
    let status = if cancelled { "cancelled" } else { "failure" };
    UPLOADS_TOTAL.with_label_values(&[method, status]).inc();
}

/// Record upload duration
pub fn record_upload_duration(method: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[method])
        .observe(duration_secs);
}

/// Record a chunk outcome
pub fn record_chunk(method: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    CHUNKS_TOTAL.with_label_values(&[method, status]).inc();
}

/// Record a retried request
pub fn record_retry(operation: &str) {
    RETRIES_TOTAL.with_label_values(&[operation]).inc();
}

/// Render the default registry in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
