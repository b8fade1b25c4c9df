//! Prometheus metrics for the event log, command bus and projections.
//!
//! Recording goes through the `metrics` facade and is a no-op until
//! [`init_metrics`] installs the Prometheus recorder.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is installed
    #[serde(default)]
    pub enabled: bool,

    /// Address the exporter's scrape endpoint listens on
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9090".to_string()
}

/// Install the Prometheus recorder and its HTTP scrape listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.listen.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", service_name)
        .install()?;

    register_metric_descriptions();

    tracing::info!(service_name = %service_name, listen = %addr, "Metrics exporter installed");
    Ok(())
}

fn register_metric_descriptions() {
    describe_counter!("ledger_events_appended_total", "Events committed to the log");
    describe_counter!(
        "ledger_append_conflicts_total",
        "Appends rejected by the expected-version check"
    );
    describe_counter!("ledger_commands_total", "Dispatched commands by type and outcome");
    describe_counter!("ledger_errors_total", "Errors by code");
    describe_counter!(
        "ledger_projection_failures_total",
        "Projector failures by projection"
    );
    describe_counter!(
        "ledger_read_model_save_retries_total",
        "Read model saves retried after a transient failure"
    );
    describe_gauge!(
        "ledger_projection_position",
        "Last global position processed by each projection"
    );
    describe_gauge!("ledger_log_head_position", "Last global position in the log");
    describe_histogram!(
        "ledger_processor_batch_seconds",
        "Time spent processing one batch of events"
    );
}

/// Recording helpers for ledger metrics.
pub struct LedgerMetrics;

impl LedgerMetrics {
    pub fn events_appended(aggregate_type: &'static str, count: usize, head: u64) {
        counter!("ledger_events_appended_total", "aggregate_type" => aggregate_type)
            .increment(count as u64);
        gauge!("ledger_log_head_position").set(head as f64);
    }

    pub fn append_conflict(aggregate_type: &'static str) {
        counter!("ledger_append_conflicts_total", "aggregate_type" => aggregate_type).increment(1);
    }

    pub fn command(command_type: &'static str, outcome: &'static str) {
        counter!(
            "ledger_commands_total",
            "command_type" => command_type,
            "outcome" => outcome,
        )
        .increment(1);
    }

    pub fn projection_failure(projection: &'static str) {
        counter!("ledger_projection_failures_total", "projection" => projection).increment(1);
    }

    pub fn projection_position(projection: &'static str, position: u64) {
        gauge!("ledger_projection_position", "projection" => projection).set(position as f64);
    }

    pub fn save_retry(table: &'static str) {
        counter!("ledger_read_model_save_retries_total", "table" => table).increment(1);
    }

    pub fn batch_duration(seconds: f64) {
        histogram!("ledger_processor_batch_seconds").record(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_by_default() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert!(init_metrics(&config, "test").is_ok());
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        LedgerMetrics::events_appended("agent", 2, 10);
        LedgerMetrics::command("CreateAgent", "ok");
        LedgerMetrics::projection_position("agents", 10);
    }
}
