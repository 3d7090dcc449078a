// packages/agent/src/observability.rs
//! Logging and metrics setup
//!
//! Logs go through `tracing`; `RUST_LOG` wins over the configured filter.
//! Metrics go through the `metrics` facade and are exposed by a Prometheus
//! HTTP listener when `observability.metrics_listen` is set.

use crate::utils::config::{LogFormat, ObservabilityConfig};
use crate::utils::errors::{AgentError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .map_err(|e| AgentError::ConfigError(format!("invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let installed = match config.log_format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };

    installed.map_err(|e| AgentError::ConfigError(format!("failed to install tracing: {}", e)))
}

/// Install the Prometheus exporter, if configured
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(addr) = config.metrics_listen else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| AgentError::ConfigError(format!("failed to install metrics exporter: {}", e)))?;

    describe_metrics();
    info!("Serving Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

fn describe_metrics() {
    metrics::describe_counter!(
        "workflow_agent_claims_total",
        "Claim attempts that changed or confirmed ownership, by outcome"
    );
    metrics::describe_counter!(
        "workflow_agent_write_conflicts_total",
        "Conditional writes rejected because of a stale resource version"
    );
    metrics::describe_counter!(
        "workflow_agent_controller_events_total",
        "Watch events received, by kind and event type"
    );
    metrics::describe_counter!(
        "workflow_agent_handler_failures_total",
        "Watch events whose handler returned an error"
    );
    metrics::describe_counter!(
        "workflow_agent_unmatched_instances_total",
        "Reconciles skipped because no process rule applied"
    );
    metrics::describe_counter!("workflow_agent_processes_started_total", "Processes started");
    metrics::describe_counter!("workflow_agent_processes_stopped_total", "Processes stopped");
    metrics::describe_counter!(
        "workflow_agent_process_failures_total",
        "Process create, start or stop failures, by stage"
    );
    metrics::describe_counter!(
        "workflow_agent_process_exits_total",
        "Observed process exits, by outcome"
    );
    metrics::describe_gauge!(
        "workflow_agent_tracked_processes",
        "Processes currently tracked by this agent"
    );
}
