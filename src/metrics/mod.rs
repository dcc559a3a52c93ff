//! Metrics module
//!
//! Prometheus metrics for the upload coordinator, served by [`server::MetricsServer`].

pub mod server;

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec,
    register_int_gauge, Counter, CounterVec, Histogram, HistogramVec, IntGauge,
};

lazy_static! {
    // Upload lifecycle
    pub static ref UPLOADS_STARTED: Counter = register_counter!(
        "chunk_uploadr_uploads_started_total",
        "Uploads started"
    ).unwrap();

    pub static ref UPLOADS_RESUMED: Counter = register_counter!(
        "chunk_uploadr_uploads_resumed_total",
        "Resume calls accepted for registered uploads"
    ).unwrap();

    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "chunk_uploadr_uploads_total",
        "Upload rounds by terminal status",
        &["status"]
    ).unwrap();

    pub static ref INCOMPLETE_UPLOADS: IntGauge = register_int_gauge!(
        "chunk_uploadr_incomplete_uploads",
        "Uploads currently held in the registry"
    ).unwrap();

    pub static ref EXPIRED_UPLOADS: Counter = register_counter!(
        "chunk_uploadr_expired_uploads_total",
        "Incomplete uploads evicted by the expiry sweep"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "chunk_uploadr_upload_duration_seconds",
        "Time from start to terminal status",
        &["status"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0, 1800.0]
    ).unwrap();

    // Parts
    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "chunk_uploadr_upload_bytes_total",
        "Bytes acknowledged by the backend"
    ).unwrap();

    pub static ref PARTS_TOTAL: CounterVec = register_counter_vec!(
        "chunk_uploadr_parts_total",
        "Parts offered to the backend",
        &["status"]
    ).unwrap();

    pub static ref PART_SIZE: Histogram = register_histogram!(
        "chunk_uploadr_part_size_bytes",
        "Size of acknowledged parts",
        vec![1024.0, 65536.0, 1048576.0, 8388608.0, 52428800.0, 104857600.0]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "chunk_uploadr_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a new upload
pub fn record_upload_started() {
    UPLOADS_STARTED.inc();
}

/// Record an accepted resume
pub fn record_upload_resumed() {
    UPLOADS_RESUMED.inc();
}

/// Record an acknowledged part
pub fn record_part_uploaded(bytes: u64) {
    PARTS_TOTAL.with_label_values(&["success"]).inc();
    PART_SIZE.observe(bytes as f64);
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a part the backend rejected
pub fn record_part_failure() {
    PARTS_TOTAL.with_label_values(&["failure"]).inc();
}

/// Record a completed upload
pub fn record_upload_success(duration_secs: f64) {
    UPLOADS_TOTAL.with_label_values(&["success"]).inc();
    UPLOAD_DURATION
        .with_label_values(&["success"])
        .observe(duration_secs);
}

/// Record an upload round that ended with an error
///
/// # Arguments
/// * `kind` - Error label, see `UploadError::kind`
/// * `resumable` - Whether the upload stays registered
pub fn record_upload_failure(kind: &str, resumable: bool, duration_secs: f64) {
    let status = if resumable { "interrupted" } else { "failure" };
    UPLOADS_TOTAL.with_label_values(&[status]).inc();
    UPLOAD_DURATION
        .with_label_values(&[status])
        .observe(duration_secs);
    record_error(kind);
}

/// Record uploads evicted by a sweep
pub fn record_expired(count: usize) {
    EXPIRED_UPLOADS.inc_by(count as f64);
}

/// Set the number of registered uploads
pub fn set_incomplete_uploads(count: usize) {
    INCOMPLETE_UPLOADS.set(count as i64);
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}
