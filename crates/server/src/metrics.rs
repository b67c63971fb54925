//! Observability Metrics
//!
//! Prometheus metrics for the voice session server.

use std::sync::OnceLock;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::state::AppState;
use crate::ServerError;

/// Global Prometheus handle
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder
///
/// Call once at startup before recording anything.
pub fn init_metrics() -> Result<PrometheusHandle, ServerError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ServerError::Internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    register_default_metrics();

    METRICS_HANDLE.get_or_init(|| handle.clone());
    Ok(handle)
}

pub fn get_metrics_handle() -> Option<&'static PrometheusHandle> {
    METRICS_HANDLE.get()
}

fn register_default_metrics() {
    gauge!("voice_session_sessions_active").set(0.0);
    counter!("voice_session_sessions_created_total").absolute(0);
    counter!("voice_session_turns_total").absolute(0);
    counter!("voice_session_interruptions_total").absolute(0);

    counter!("voice_session_segments_total", "result" => "synthesized").absolute(0);
    counter!("voice_session_segments_total", "result" => "failed").absolute(0);

    histogram!("voice_session_end_of_turn_delay_seconds").record(0.0);
    histogram!("voice_session_first_audio_latency_seconds").record(0.0);

    counter!("voice_session_protocol_errors_total", "kind" => "malformed").absolute(0);
    counter!("voice_session_protocol_errors_total", "kind" => "rate_limited").absolute(0);
}

pub fn record_session_created() {
    counter!("voice_session_sessions_created_total").increment(1);
}

pub fn record_active_sessions(count: usize) {
    gauge!("voice_session_sessions_active").set(count as f64);
}

/// A user turn was committed after `delay` of endpoint wait
pub fn record_turn(delay_secs: f64) {
    counter!("voice_session_turns_total").increment(1);
    histogram!("voice_session_end_of_turn_delay_seconds").record(delay_secs);
}

pub fn record_interruption() {
    counter!("voice_session_interruptions_total").increment(1);
}

/// Time from turn commit to the first audio packet of the reply
pub fn record_first_audio_latency(duration_secs: f64) {
    histogram!("voice_session_first_audio_latency_seconds").record(duration_secs);
}

pub fn record_segment(synthesized: bool) {
    let result = if synthesized { "synthesized" } else { "failed" };
    counter!("voice_session_segments_total", "result" => result).increment(1);
}

pub fn record_protocol_error(kind: &'static str) {
    counter!("voice_session_protocol_errors_total", "kind" => kind).increment(1);
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    record_active_sessions(state.sessions.count());

    match get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            "Metrics not initialized".to_string(),
        ),
    }
}
