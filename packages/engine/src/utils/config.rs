// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Layered, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. Optional config file (YAML, TOML or JSON, detected by extension)
//! 3. `SKYHOOK_*` environment variables (`__` separates nested keys)
//! 4. Command-line flags, applied by the binary after loading
//!
//! The engine never parses values itself beyond this; it only validates them.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "SKYHOOK_CONFIG";

/// Prefix for environment overrides
const ENV_PREFIX: &str = "SKYHOOK";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub health: HealthConfig,
    pub request: RequestConfig,
    pub gc: GcConfig,
    pub logging: LoggingConfig,
}

/// Listener configuration for the adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Invocation endpoint
    pub invoke_addr: SocketAddr,

    /// Liveness/readiness/metrics endpoint
    pub health_addr: SocketAddr,

    /// Largest accepted invocation body
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            invoke_addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// How worker processes are launched
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Executable name (looked up in PATH) or absolute path
    pub command: String,

    /// Arguments; `{port}`, `{handler}`, `{bootstrap}` and `{workdir}` are substituted
    pub args: Vec<String>,

    /// File name the code unit is written to inside the working directory
    pub handler_file: String,

    /// Parent directory for per-worker working directories
    pub temp_dir: PathBuf,

    /// First port handed to workers
    pub base_port: u16,

    /// Number of ports available from `base_port`
    pub port_range: u16,

    /// In-worker execution limit passed to the bootstrap
    pub execution_timeout_ms: u64,

    /// Extra environment for every worker
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: "node".to_string(),
            args: vec!["{bootstrap}".to_string()],
            handler_file: "handler.mjs".to_string(),
            temp_dir: std::env::temp_dir().join("skyhook"),
            base_port: 3000,
            port_range: 1000,
            execution_timeout_ms: 25_000,
            env: BTreeMap::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}

/// Readiness probing of freshly spawned workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Readiness path on the worker
    pub path: String,

    /// Delay between probes
    pub poll_interval_ms: u64,

    /// Overall budget measured from the first probe
    pub deadline_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            poll_interval_ms: 100,
            deadline_ms: 10_000,
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// Invocation forwarding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Invocation path on the worker
    pub path: String,

    /// Per-request deadline
    pub timeout_ms: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            path: "/invoke".to_string(),
            timeout_ms: 30_000,
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Idle eviction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Sweep period
    pub interval_secs: u64,

    /// Idle duration after which an unreferenced worker is evicted
    pub idle_timeout_secs: u64,

    /// Time a worker gets to exit after SIGTERM before SIGKILL
    pub stop_grace_ms: u64,

    /// Budget for draining all workers on shutdown
    pub shutdown_grace_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            idle_timeout_secs: 300,
            stop_grace_ms: 5_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Text on a terminal, JSON otherwise
    #[default]
    Auto,
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(LogFormat::Auto),
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(EngineError::Config(format!(
                "unknown log format '{}' (expected auto, text or json)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Auto,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `SKYHOOK_CONFIG` (if set) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load configuration from an optional file plus the environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("runtime.args"),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(EngineError::Config(format!("{} must be positive", name)));
            }
            Ok(())
        }

        positive("gc.interval_secs", self.gc.interval_secs)?;
        positive("gc.idle_timeout_secs", self.gc.idle_timeout_secs)?;
        positive("gc.stop_grace_ms", self.gc.stop_grace_ms)?;
        positive("gc.shutdown_grace_ms", self.gc.shutdown_grace_ms)?;
        positive("health.poll_interval_ms", self.health.poll_interval_ms)?;
        positive("health.deadline_ms", self.health.deadline_ms)?;
        positive("request.timeout_ms", self.request.timeout_ms)?;
        positive("runtime.execution_timeout_ms", self.runtime.execution_timeout_ms)?;

        if self.health.poll_interval_ms >= self.health.deadline_ms {
            return Err(EngineError::Config(
                "health.poll_interval_ms must be smaller than health.deadline_ms".to_string(),
            ));
        }

        if self.runtime.base_port == 0 {
            return Err(EngineError::Config("runtime.base_port cannot be 0".to_string()));
        }
        if self.runtime.port_range == 0 {
            return Err(EngineError::Config("runtime.port_range cannot be 0".to_string()));
        }
        if u32::from(self.runtime.base_port) + u32::from(self.runtime.port_range) > 65_536 {
            return Err(EngineError::Config(format!(
                "port range {}+{} exceeds 65535",
                self.runtime.base_port, self.runtime.port_range
            )));
        }

        if self.runtime.command.trim().is_empty() {
            return Err(EngineError::Config("runtime.command cannot be empty".to_string()));
        }
        if self.runtime.handler_file.trim().is_empty()
            || self.runtime.handler_file.contains(std::path::MAIN_SEPARATOR)
        {
            return Err(EngineError::Config(
                "runtime.handler_file must be a plain file name".to_string(),
            ));
        }
        if self.runtime.temp_dir.as_os_str().is_empty() {
            return Err(EngineError::Config("runtime.temp_dir cannot be empty".to_string()));
        }

        for (name, path) in [
            ("health.path", &self.health.path),
            ("request.path", &self.request.path),
        ] {
            if !path.starts_with('/') {
                return Err(EngineError::Config(format!("{} must start with '/'", name)));
            }
        }

        if self.server.max_body_bytes == 0 {
            return Err(EngineError::Config("server.max_body_bytes must be positive".to_string()));
        }

        Ok(())
    }
}
