//! Prometheus metrics for monitoring the media gateway.
//!
//! This module provides a centralized metrics registry with various metric types
//! for tracking requests, upstream latency, chat streams and uploads.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, Encoder, GaugeVec,
    HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, route, provider and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds (time to response headers)
    pub request_duration: HistogramVec,

    /// Number of currently active requests by route
    pub active_requests: GaugeVec,

    /// Upstream response latency histogram in seconds
    pub upstream_latency: HistogramVec,

    /// Upstream failures by provider and kind (timeout, connect, status)
    pub upstream_errors: IntCounterVec,

    /// Chat envelopes written to clients
    pub stream_chunks: IntCounterVec,

    /// Streams that ended because the client went away
    pub client_disconnects: IntCounterVec,

    /// Upload attempts by backend and outcome
    pub uploads: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "media_gateway_requests_total",
            "Total number of requests",
            &["method", "route", "provider", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "media_gateway_request_duration_seconds",
            "Request duration in seconds",
            &["method", "route", "provider"],
            vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "media_gateway_active_requests",
            "Number of active requests",
            &["route"]
        )
        .expect("Failed to register active_requests metric");

        let upstream_latency = register_histogram_vec!(
            "media_gateway_upstream_latency_seconds",
            "Upstream response latency in seconds",
            &["provider"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
        )
        .expect("Failed to register upstream_latency metric");

        let upstream_errors = register_int_counter_vec!(
            "media_gateway_upstream_errors_total",
            "Upstream failures",
            &["provider", "kind"]
        )
        .expect("Failed to register upstream_errors metric");

        let stream_chunks = register_int_counter_vec!(
            "media_gateway_stream_chunks_total",
            "Chat stream chunks written to clients",
            &["kind"]
        )
        .expect("Failed to register stream_chunks metric");

        let client_disconnects = register_int_counter_vec!(
            "media_gateway_client_disconnects_total",
            "Streams aborted by client disconnect",
            &["route"]
        )
        .expect("Failed to register client_disconnects metric");

        let uploads = register_int_counter_vec!(
            "media_gateway_uploads_total",
            "Upload attempts",
            &["backend", "outcome"]
        )
        .expect("Failed to register uploads metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            upstream_latency,
            upstream_errors,
            stream_chunks,
            client_disconnects,
            uploads,
        }
    })
}

/// Get the global metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

/// Render all registered metrics in the Prometheus text format.
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
