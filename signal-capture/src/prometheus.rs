// prometheus exporter setup

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics::counter;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

use crate::api::IngestionOutcome;

pub const SIGNALS_RECEIVED_TOTAL: &str = "signal_capture_signals_received_total";
pub const SIGNALS_INGESTED_TOTAL: &str = "signal_capture_signals_ingested_total";
pub const SIGNALS_DROPPED_TOTAL: &str = "signal_capture_signals_dropped_total";
pub const OUTCOMES_TOTAL: &str = "signal_capture_outcomes_total";
pub const SINK_DURATION_SECONDS: &str = "signal_capture_sink_duration_seconds";
pub const WINDOW_ENTRIES: &str = "signal_capture_window_entries";
pub const WINDOW_EVICTED_TOTAL: &str = "signal_capture_window_evicted_total";

pub fn report_dropped_signals(cause: &'static str, quantity: u64) {
    counter!(SIGNALS_DROPPED_TOTAL, "cause" => cause).increment(quantity);
}

pub fn report_outcome(outcome: &IngestionOutcome) {
    counter!(OUTCOMES_TOTAL, "outcome" => outcome.as_tag()).increment(1);
}

pub fn report_window_evictions(cause: &'static str, quantity: usize) {
    if quantity > 0 {
        counter!(WINDOW_EVICTED_TOTAL, "cause" => cause).increment(quantity as u64);
    }
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    // Sink calls are bounded by SINK_TIMEOUT_MS, the tail buckets only catch slow HTTP clients
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("http_requests_duration_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .unwrap()
        .set_buckets_for_metric(
            Matcher::Full(SINK_DURATION_SECONDS.to_string()),
            EXPONENTIAL_SECONDS,
        )
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Middleware to record some common HTTP metrics
/// Someday tower-http might provide a metrics middleware: https://github.com/tower-rs/tower-http/issues/57
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    // Run the rest of the request handling first, so we can measure it and get response
    // codes.
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
