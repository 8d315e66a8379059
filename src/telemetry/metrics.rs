//! Prometheus metrics export

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use crate::control::DriftStatus;
use crate::utils::types::{AgentId, Signal, StatusSnapshot};

pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_metrics();
    info!("Prometheus metrics server started on {}", addr);
    Ok(())
}

fn register_metrics() {
    // Agent health
    describe_gauge!("forecast_supervisor_confidence", "Forecast confidence score, 0-100");
    describe_gauge!("forecast_supervisor_warning_count", "Degraded bars counted by the drift controller");
    describe_gauge!("forecast_supervisor_agent_status", "Lifecycle status code of the agent");
    describe_gauge!("forecast_supervisor_model_valid", "1 when the model is not quarantined");
    describe_gauge!("forecast_supervisor_pair_permission", "1 when a hierarchical pair may trade");

    // Decisions
    describe_counter!("forecast_supervisor_drift_checks_total", "Drift classifications by outcome");
    describe_counter!("forecast_supervisor_entries_total", "Entry signals forwarded to execution");
    describe_counter!("forecast_supervisor_trailing_exits_total", "Positions closed by the trailing forecast");

    // Model lifecycle
    describe_counter!("forecast_supervisor_retrains_total", "Full retrains by result");
    describe_counter!("forecast_supervisor_fine_tunes_total", "Light adaptations requested");
    describe_counter!("forecast_supervisor_fatal_total", "Agents that exhausted their retrain budget");
    describe_counter!("forecast_supervisor_admission_denied_total", "Retrain slot requests denied");

    // Latency
    describe_histogram!("forecast_supervisor_bar_latency_us", "Per-bar decision latency");
}

pub fn record_drift(agent: &AgentId, status: DriftStatus) {
    counter!(
        "forecast_supervisor_drift_checks_total",
        "agent" => agent.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_entry(agent: &AgentId, signal: Signal) {
    counter!(
        "forecast_supervisor_entries_total",
        "agent" => agent.to_string(),
        "signal" => signal.to_string()
    )
    .increment(1);
}

pub fn record_retrain(agent: &AgentId, success: bool) {
    counter!(
        "forecast_supervisor_retrains_total",
        "agent" => agent.to_string(),
        "result" => if success { "ok" } else { "failed" }
    )
    .increment(1);
}

pub fn record_fine_tune(agent: &AgentId) {
    counter!("forecast_supervisor_fine_tunes_total", "agent" => agent.to_string()).increment(1);
}

pub fn record_fatal(agent: &AgentId) {
    counter!("forecast_supervisor_fatal_total", "agent" => agent.to_string()).increment(1);
}

pub fn record_bar_latency(agent: &AgentId, latency_us: f64) {
    histogram!("forecast_supervisor_bar_latency_us", "agent" => agent.to_string()).record(latency_us);
}

pub fn record_snapshot(snapshot: &StatusSnapshot, status_code: u8, model_valid: bool) {
    let agent = snapshot.id.clone();
    gauge!("forecast_supervisor_confidence", "agent" => agent.clone()).set(snapshot.confidence);
    gauge!("forecast_supervisor_warning_count", "agent" => agent.clone()).set(snapshot.warning_count as f64);
    gauge!("forecast_supervisor_agent_status", "agent" => agent.clone()).set(status_code as f64);
    gauge!("forecast_supervisor_model_valid", "agent" => agent).set(if model_valid { 1.0 } else { 0.0 });
}

pub fn record_pair_permission(instrument: &str, green: bool) {
    gauge!("forecast_supervisor_pair_permission", "instrument" => instrument.to_string())
        .set(if green { 1.0 } else { 0.0 });
}
