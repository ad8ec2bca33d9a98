// packages/engine/src/observability/mod.rs
//! Logging and metrics
//!
//! - **Tracing**: `tracing-subscriber` fmt layer, text or JSON, filtered by
//!   `RUST_LOG` or the configured level
//! - **Metrics**: `metrics` facade backed by a Prometheus recorder whose
//!   handle is rendered by the health server at `/metrics`
//!
//! Metric calls are no-ops until a recorder is installed, so library code and
//! tests record unconditionally.

use crate::utils::config::{LogFormat, LoggingConfig};
use anyhow::{anyhow, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::io::IsTerminal;
use tracing_subscriber::EnvFilter;

/// Metric names
pub mod names {
    /// Spawn attempts, labelled by `outcome`
    pub const SPAWNS_TOTAL: &str = "skyhook_spawns_total";
    /// Time from spawn to first successful probe
    pub const READY_SECONDS: &str = "skyhook_worker_ready_seconds";
    /// Invocations, labelled by `outcome`
    pub const INVOCATIONS_TOTAL: &str = "skyhook_invocations_total";
    /// Proxy latency
    pub const INVOCATION_SECONDS: &str = "skyhook_invocation_seconds";
    /// Evictions, labelled by `reason`
    pub const EVICTIONS_TOTAL: &str = "skyhook_evictions_total";
    /// Registered workers
    pub const WORKERS: &str = "skyhook_workers";
}

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the global tracing subscriber
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| anyhow!("invalid log level '{}': {}", config.level, e))?;

    let json = match config.format {
        LogFormat::Json => true,
        LogFormat::Text => false,
        LogFormat::Auto => !std::io::stderr().is_terminal(),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

/// Install the Prometheus recorder and register metric descriptions
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), LATENCY_BUCKETS)?
        .install_recorder()?;

    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(names::SPAWNS_TOTAL, "Worker spawn attempts by outcome");
    metrics::describe_histogram!(
        names::READY_SECONDS,
        metrics::Unit::Seconds,
        "Time from process launch to first successful readiness probe"
    );
    metrics::describe_counter!(names::INVOCATIONS_TOTAL, "Proxied invocations by outcome");
    metrics::describe_histogram!(
        names::INVOCATION_SECONDS,
        metrics::Unit::Seconds,
        "Latency of proxied invocations"
    );
    metrics::describe_counter!(names::EVICTIONS_TOTAL, "Worker terminations by reason");
    metrics::describe_gauge!(names::WORKERS, "Workers currently registered");
}
