// packages/engine/src/runtime/spawner.rs
//! Spawning and stopping worker processes
//!
//! Each worker gets a fresh working directory holding the code unit and the
//! embedded bootstrap, a loopback port, and a child process running the
//! configured runtime command. `spawn` returns as soon as the process is
//! launched; readiness is the prober's job.
//!
//! The spawner is the sole owner of the OS process and the working directory.
//! Everything else refers to a worker process through an opaque [`ProcessId`].

use crate::runtime::fingerprint::Fingerprint;
use crate::runtime::ports::PortAllocator;
use crate::utils::config::RuntimeConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// File name of the bootstrap inside every working directory
pub const BOOTSTRAP_FILE: &str = "bootstrap.mjs";

const BOOTSTRAP_SOURCE: &str = include_str!("../../assets/bootstrap.mjs");

/// Opaque reference to a process owned by a [`Spawner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc-{}", self.0)
    }
}

/// What to spawn
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub fingerprint: &'a Fingerprint,
    pub source: &'a str,
    /// Preferred port offset within the configured range
    pub port_hint: u16,
}

/// A launched (not necessarily ready) worker process
#[derive(Debug, Clone)]
pub struct SpawnedWorker {
    pub endpoint: SocketAddr,
    pub process_id: ProcessId,
    pub os_pid: Option<u32>,
}

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Unknown or already stopped process
    AlreadyStopped,
    /// Process had exited on its own
    Exited,
    /// Process exited after SIGTERM within the grace period
    Terminated,
    /// Process ignored SIGTERM and was killed
    Killed,
}

/// Starts and stops worker processes
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Launch a worker for `request`; does not wait for readiness
    async fn spawn(&self, request: SpawnRequest<'_>) -> Result<SpawnedWorker>;

    /// SIGTERM, wait up to `grace`, then SIGKILL; always cleans up the
    /// working directory. Stopping an unknown process is a no-op.
    async fn stop(&self, process_id: ProcessId, grace: Duration) -> Result<StopOutcome>;
}

/// A process owned by [`ProcessSpawner`]
struct ManagedProcess {
    child: Child,
    port: u16,
    work_dir: TempDir,
    fingerprint: String,
}

/// Spawner backed by OS child processes
pub struct ProcessSpawner {
    config: RuntimeConfig,

    /// Resolved runtime executable (cached)
    executable: Mutex<Option<PathBuf>>,

    ports: PortAllocator,

    processes: DashMap<ProcessId, ManagedProcess>,

    next_id: AtomicU64,

    /// Environment added on top of `config.env`
    extra_env: Vec<(String, String)>,
}

impl ProcessSpawner {
    /// Create a spawner for the given runtime configuration
    pub fn new(config: RuntimeConfig) -> Self {
        let ports = PortAllocator::new(config.base_port, config.port_range);
        Self::with_ports(config, ports)
    }

    /// Create a spawner with a custom port allocator
    pub fn with_ports(config: RuntimeConfig, ports: PortAllocator) -> Self {
        Self {
            config,
            executable: Mutex::new(None),
            ports,
            processes: DashMap::new(),
            next_id: AtomicU64::new(0),
            extra_env: Vec::new(),
        }
    }

    /// Add an environment variable passed to every worker
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }

    /// Number of processes currently owned
    pub fn live_processes(&self) -> usize {
        self.processes.len()
    }

    /// Working directory of a live process
    pub fn work_dir(&self, process_id: ProcessId) -> Option<PathBuf> {
        self.processes
            .get(&process_id)
            .map(|p| p.work_dir.path().to_path_buf())
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Resolve the runtime executable
    fn find_executable(&self) -> Result<PathBuf> {
        if let Some(path) = self.executable.lock().as_ref() {
            return Ok(path.clone());
        }

        let command = self.config.command.as_str();
        let candidate = Path::new(command);

        let path = if candidate.components().count() > 1 {
            if !candidate.is_file() {
                return Err(EngineError::Spawn(format!(
                    "runtime executable {} does not exist",
                    candidate.display()
                )));
            }
            candidate.to_path_buf()
        } else {
            which::which(command).map_err(|e| {
                EngineError::Spawn(format!("Executable '{}' not found in PATH: {}", command, e))
            })?
        };

        info!("Found runtime {} at {:?}", command, path);
        *self.executable.lock() = Some(path.clone());
        Ok(path)
    }

    /// Substitute placeholders in the configured arguments
    fn render_args(
        &self,
        port: u16,
        handler: &Path,
        bootstrap: &Path,
        work_dir: &Path,
    ) -> Vec<String> {
        let port = port.to_string();
        let handler = handler.to_string_lossy();
        let bootstrap = bootstrap.to_string_lossy();
        let work_dir = work_dir.to_string_lossy();

        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port)
                    .replace("{handler}", &handler)
                    .replace("{bootstrap}", &bootstrap)
                    .replace("{workdir}", &work_dir)
            })
            .collect()
    }

    /// Write the code unit and bootstrap into a fresh working directory
    async fn materialize(&self, request: &SpawnRequest<'_>) -> Result<TempDir> {
        tokio::fs::create_dir_all(&self.config.temp_dir)
            .await
            .map_err(|e| {
                EngineError::Spawn(format!(
                    "cannot create temp dir {}: {}",
                    self.config.temp_dir.display(),
                    e
                ))
            })?;

        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{}-", request.fingerprint.short()))
            .tempdir_in(&self.config.temp_dir)
            .map_err(|e| EngineError::Spawn(format!("cannot create working directory: {}", e)))?;

        let handler = work_dir.path().join(&self.config.handler_file);
        tokio::fs::write(&handler, request.source)
            .await
            .map_err(|e| EngineError::Spawn(format!("cannot write {}: {}", handler.display(), e)))?;

        let bootstrap = work_dir.path().join(BOOTSTRAP_FILE);
        tokio::fs::write(&bootstrap, BOOTSTRAP_SOURCE)
            .await
            .map_err(|e| {
                EngineError::Spawn(format!("cannot write {}: {}", bootstrap.display(), e))
            })?;

        Ok(work_dir)
    }
}

#[async_trait]
impl Spawner for ProcessSpawner {
    async fn spawn(&self, request: SpawnRequest<'_>) -> Result<SpawnedWorker> {
        let executable = self.find_executable()?;
        let work_dir = self.materialize(&request).await?;
        let port = self.ports.allocate(request.port_hint)?;

        let handler = work_dir.path().join(&self.config.handler_file);
        let bootstrap = work_dir.path().join(BOOTSTRAP_FILE);
        let short = request.fingerprint.short().to_string();

        debug!(fingerprint = %short, port, "Spawning worker: {:?}", executable);

        let mut command = Command::new(&executable);
        command
            .args(self.render_args(port, &handler, &bootstrap, work_dir.path()))
            .current_dir(work_dir.path())
            .env("PORT", port.to_string())
            .env("SKYHOOK_HANDLER", &handler)
            .env("SKYHOOK_WORKDIR", work_dir.path())
            .env("SKYHOOK_FINGERPRINT", request.fingerprint.as_str())
            .env(
                "SKYHOOK_EXECUTION_TIMEOUT_MS",
                self.config.execution_timeout_ms.to_string(),
            )
            .envs(&self.config.env)
            .envs(self.extra_env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.ports.release(port);
                return Err(EngineError::Spawn(format!(
                    "Failed to launch {}: {}",
                    executable.display(),
                    e
                )));
            }
        };

        let os_pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, short.clone(), OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, short.clone(), OutputStream::Stderr));
        }

        let process_id = ProcessId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        info!(
            fingerprint = %short,
            pid = ?os_pid,
            port,
            "Worker process spawned"
        );

        self.processes.insert(
            process_id,
            ManagedProcess {
                child,
                port,
                work_dir,
                fingerprint: short,
            },
        );

        Ok(SpawnedWorker {
            endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            process_id,
            os_pid,
        })
    }

    async fn stop(&self, process_id: ProcessId, grace: Duration) -> Result<StopOutcome> {
        let Some((_, mut managed)) = self.processes.remove(&process_id) else {
            return Ok(StopOutcome::AlreadyStopped);
        };

        let outcome = terminate(&mut managed.child, grace, &managed.fingerprint).await;

        self.ports.release(managed.port);

        let dir = managed.work_dir.path().to_path_buf();
        if let Err(e) = managed.work_dir.close() {
            warn!(
                fingerprint = %managed.fingerprint,
                "Failed to remove working directory {}: {}",
                dir.display(),
                e
            );
        } else {
            debug!(
                fingerprint = %managed.fingerprint,
                "Removed working directory {}",
                dir.display()
            );
        }

        outcome
    }
}

/// SIGTERM, bounded wait, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration, fingerprint: &str) -> Result<StopOutcome> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.try_wait() {
        Ok(Some(status)) => {
            debug!(fingerprint, "Worker already exited with {}", status);
            return Ok(StopOutcome::Exited);
        }
        Ok(None) => {}
        Err(e) => warn!(fingerprint, "Failed to poll worker status: {}", e),
    }

    if let Some(pid) = child.id() {
        debug!(fingerprint, "Sending SIGTERM to PID {}", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(fingerprint, "SIGTERM to PID {} failed: {}", pid, e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(fingerprint, "Worker exited with {}", status);
            Ok(StopOutcome::Terminated)
        }
        Ok(Err(e)) => {
            // Could not reap it; make sure it is gone anyway
            let _ = child.start_kill();
            Err(EngineError::Eviction(format!("failed waiting for worker: {}", e)))
        }
        Err(_) => {
            warn!(fingerprint, "Worker did not exit within {:?}, sending SIGKILL", grace);
            child
                .kill()
                .await
                .map_err(|e| EngineError::Eviction(format!("failed to kill worker: {}", e)))?;
            Ok(StopOutcome::Killed)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Relay child output into the log, line by line
async fn forward_output<R>(reader: R, fingerprint: String, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match stream {
                OutputStream::Stdout => {
                    debug!(target: "skyhook::worker", fingerprint = %fingerprint, "{}", line)
                }
                OutputStream::Stderr => {
                    warn!(
                        target: "skyhook::worker",
                        fingerprint = %fingerprint,
                        stream = "stderr",
                        "{}",
                        line
                    )
                }
            },
            Ok(None) => break,
            Err(e) => {
                debug!(fingerprint = %fingerprint, "Stopped reading worker output: {}", e);
                break;
            }
        }
    }
}
