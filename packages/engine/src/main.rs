// packages/engine/src/main.rs
//! Skyhook Engine
//!
//! Serves function invocations by keeping one warm runtime process per
//! distinct code unit.

use anyhow::{Context, Result};
use clap::Parser;
use skyhook_engine::observability::{init_metrics, init_tracing};
use skyhook_engine::runtime::ProcessManager;
use skyhook_engine::server::{self, HealthService, InvokeService};
use skyhook_engine::utils::config::{LogFormat, CONFIG_PATH_ENV};
use skyhook_engine::{BuildInfo, EngineConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed for in-flight invocations to finish once the invoke listener stops
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "skyhook-engine", version, about = "Per-function runtime process manager")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Invocation listener address
    #[arg(long)]
    invoke_addr: Option<SocketAddr>,

    /// Health and metrics listener address
    #[arg(long)]
    health_addr: Option<SocketAddr>,

    /// Runtime executable
    #[arg(long)]
    runtime_command: Option<String>,

    /// Parent directory for worker working directories
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    #[arg(long)]
    base_port: Option<u16>,

    #[arg(long)]
    port_range: Option<u16>,

    /// Sweep period of the idle collector
    #[arg(long)]
    gc_interval_secs: Option<u64>,

    /// Idle time after which a worker is stopped
    #[arg(long)]
    idle_timeout_secs: Option<u64>,

    #[arg(long)]
    health_poll_interval_ms: Option<u64>,

    /// Readiness deadline for a fresh worker
    #[arg(long)]
    health_deadline_ms: Option<u64>,

    /// Per-invocation deadline
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    #[arg(long)]
    log_level: Option<String>,

    /// text, json or auto
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Flags win over file and environment
    fn apply(self, config: &mut EngineConfig) {
        if let Some(addr) = self.invoke_addr {
            config.server.invoke_addr = addr;
        }
        if let Some(addr) = self.health_addr {
            config.server.health_addr = addr;
        }
        if let Some(command) = self.runtime_command {
            config.runtime.command = command;
        }
        if let Some(dir) = self.temp_dir {
            config.runtime.temp_dir = dir;
        }
        if let Some(port) = self.base_port {
            config.runtime.base_port = port;
        }
        if let Some(range) = self.port_range {
            config.runtime.port_range = range;
        }
        if let Some(secs) = self.gc_interval_secs {
            config.gc.interval_secs = secs;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.gc.idle_timeout_secs = secs;
        }
        if let Some(ms) = self.health_poll_interval_ms {
            config.health.poll_interval_ms = ms;
        }
        if let Some(ms) = self.health_deadline_ms {
            config.health.deadline_ms = ms;
        }
        if let Some(ms) = self.request_timeout_ms {
            config.request.timeout_ms = ms;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config =
        EngineConfig::load_from(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);

    // Initialize observability (tracing, metrics, logging)
    init_tracing(&config.logging)?;
    let metrics = init_metrics()?;

    config.validate().context("invalid configuration")?;

    let build = BuildInfo::current();
    info!(
        "Starting Skyhook Engine v{} ({}, {})",
        build.version, build.git_hash, build.rustc_version
    );
    debug!("Configuration loaded: {:?}", config);

    let manager = Arc::new(ProcessManager::new(&config)?);

    let invoke_listener = TcpListener::bind(config.server.invoke_addr)
        .await
        .with_context(|| format!("binding invoke listener on {}", config.server.invoke_addr))?;
    let health_listener = TcpListener::bind(config.server.health_addr)
        .await
        .with_context(|| format!("binding health listener on {}", config.server.health_addr))?;

    let invoke_shutdown = CancellationToken::new();
    let health_shutdown = CancellationToken::new();

    let invoke_server = tokio::spawn(server::serve(
        invoke_listener,
        "invoke",
        Arc::new(InvokeService::new(Arc::clone(&manager), config.server.max_body_bytes)),
        invoke_shutdown.clone(),
    ));
    let health_server = tokio::spawn(server::serve(
        health_listener,
        "health",
        Arc::new(HealthService::new(Arc::clone(&manager), Some(metrics))),
        health_shutdown.clone(),
    ));

    wait_for_signal().await;
    info!("Received shutdown signal, cleaning up...");

    // Stop taking invocations, drain workers, then take readiness down with us
    invoke_shutdown.cancel();
    if tokio::time::timeout(LISTENER_STOP_TIMEOUT, invoke_server).await.is_err() {
        warn!("Invoke listener did not stop within {:?}", LISTENER_STOP_TIMEOUT);
    }

    let report = manager.shutdown().await;
    if report.failed > 0 {
        warn!("{} workers did not stop cleanly", report.failed);
    }

    health_shutdown.cancel();
    if tokio::time::timeout(LISTENER_STOP_TIMEOUT, health_server).await.is_err() {
        warn!("Health listener did not stop within {:?}", LISTENER_STOP_TIMEOUT);
    }

    info!("Server stopped gracefully");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
