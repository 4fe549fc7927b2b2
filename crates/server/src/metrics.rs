//! Prometheus metrics

use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::RwLock;

static HANDLE: RwLock<Option<PrometheusHandle>> = RwLock::new(None);

/// Install the recorder; idempotent (later calls are ignored).
pub fn init_metrics() {
    let mut handle = HANDLE.write();
    if handle.is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(h) => *handle = Some(h),
        Err(e) => tracing::warn!(error = %e, "metrics recorder not installed"),
    }
}

pub fn record_utterance(endpoint: &'static str) {
    metrics::counter!("hearth_utterances_total", "endpoint" => endpoint).increment(1);
}

pub fn record_tool_call(success: bool) {
    let outcome = if success { "ok" } else { "error" };
    metrics::counter!("hearth_tool_calls_total", "outcome" => outcome).increment(1);
}

pub fn record_agent_run(steps: u32, budget_exhausted: bool) {
    metrics::histogram!("hearth_agent_steps").record(steps as f64);
    if budget_exhausted {
        metrics::counter!("hearth_agent_budget_exhausted_total").increment(1);
    }
}

pub fn record_classifier_latency(seconds: f64) {
    metrics::histogram!("hearth_classifier_seconds").record(seconds);
}

/// `GET /metrics`
pub async fn metrics_handler() -> impl IntoResponse {
    HANDLE.read().as_ref().map(|h| h.render()).unwrap_or_default()
}
