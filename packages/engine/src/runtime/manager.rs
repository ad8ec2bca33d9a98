// packages/engine/src/runtime/manager.rs
//! Process manager facade
//!
//! Owns the registry, the request proxy and the garbage collector and exposes
//! the three operations adapters need: invoke, introspect, shut down.

use crate::observability::names;
use crate::runtime::fingerprint::Fingerprint;
use crate::runtime::gc::{GarbageCollector, SweepReport};
use crate::runtime::health::{HttpProber, Prober};
use crate::runtime::proxy::{RequestProxy, WorkerResponse};
use crate::runtime::registry::{Registry, RegistrySettings};
use crate::runtime::spawner::{ProcessSpawner, Spawner};
use crate::runtime::worker::{WorkerInfo, WorkerSummary};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing and routing knobs derived from [`EngineConfig`]
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub gc_interval: Duration,
    pub idle_timeout: Duration,
    pub stop_grace: Duration,
    pub shutdown_grace: Duration,
    pub health_poll_interval: Duration,
    pub health_deadline: Duration,
    pub request_timeout: Duration,
    pub request_path: String,
}

impl ManagerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            gc_interval: config.gc.interval(),
            idle_timeout: config.gc.idle_timeout(),
            stop_grace: config.gc.stop_grace(),
            shutdown_grace: config.gc.shutdown_grace(),
            health_poll_interval: config.health.poll_interval(),
            health_deadline: config.health.deadline(),
            request_timeout: config.request.timeout(),
            request_path: config.request.path.clone(),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

pub struct ProcessManager {
    registry: Arc<Registry>,
    proxy: RequestProxy,
    collector: Arc<GarbageCollector>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    settings: ManagerSettings,
}

impl ProcessManager {
    /// Build a manager that launches real runtime processes
    ///
    /// Starts the garbage collector, so it must be called inside a Tokio runtime.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.validate()?;

        let spawner = ProcessSpawner::new(config.runtime.clone())
            .with_env("SKYHOOK_HEALTH_PATH", config.health.path.clone())
            .with_env("SKYHOOK_INVOKE_PATH", config.request.path.clone());
        let prober = HttpProber::new(config.health.path.clone());

        info!(
            "Process manager configured (runtime '{}', ports {}..{})",
            config.runtime.command,
            config.runtime.base_port,
            u32::from(config.runtime.base_port) + u32::from(config.runtime.port_range)
        );

        Ok(Self::with_components(
            ManagerSettings::from_config(config),
            Arc::new(spawner),
            Arc::new(prober),
        ))
    }

    /// Build a manager over arbitrary spawner and prober implementations
    pub fn with_components(
        settings: ManagerSettings,
        spawner: Arc<dyn Spawner>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let registry = Arc::new(Registry::new(
            spawner,
            prober,
            RegistrySettings {
                health_poll_interval: settings.health_poll_interval,
                health_deadline: settings.health_deadline,
                stop_grace: settings.stop_grace,
            },
        ));

        let collector = Arc::new(GarbageCollector::new(
            Arc::clone(&registry),
            settings.gc_interval,
            settings.idle_timeout,
            settings.stop_grace,
        ));

        let shutdown = CancellationToken::new();
        let gc_task = Arc::clone(&collector).spawn(shutdown.child_token());

        Self {
            registry,
            proxy: RequestProxy::new(settings.request_path.clone()),
            collector,
            gc_task: Mutex::new(Some(gc_task)),
            shutdown,
            settings,
        }
    }

    /// Run `source` with `payload`, reusing or spawning its worker
    ///
    /// `identity` is only used for logging; workers are keyed by the content
    /// fingerprint of `source`.
    pub async fn invoke(
        &self,
        identity: &str,
        source: &str,
        payload: Bytes,
    ) -> Result<WorkerResponse> {
        let fingerprint = Fingerprint::of(source);
        debug!(function = identity, fingerprint = %fingerprint.short(), "Invocation received");

        let result = self.invoke_fingerprint(&fingerprint, source, payload).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(names::INVOCATIONS_TOTAL, "outcome" => outcome).increment(1);

        if let Err(e) = &result {
            warn!(
                function = identity,
                fingerprint = %fingerprint.short(),
                error = %e,
                "Invocation failed"
            );
        }
        result
    }

    async fn invoke_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        source: &str,
        payload: Bytes,
    ) -> Result<WorkerResponse> {
        let lease = self.registry.resolve(fingerprint, source).await?;

        let result = self
            .proxy
            .invoke(&lease, payload, self.settings.request_timeout)
            .await;

        if let Err(EngineError::WorkerUnavailable { .. }) = &result {
            self.registry.discard(lease.handle());
        }

        self.registry.release(lease);
        result
    }

    /// Metadata for every registered worker
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.registry.snapshot()
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary::from_infos(&self.registry.snapshot(), self.registry.pending_spawns())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.registry.is_closed()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Close the registry, stop the collector and drain all workers
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> SweepReport {
        info!("Shutting down process manager ({} workers)", self.registry.len());

        self.registry.close();
        self.shutdown.cancel();

        let gc_task = self.gc_task.lock().take();
        if let Some(task) = gc_task {
            if let Err(e) = task.await {
                warn!("Garbage collector task ended abnormally: {}", e);
            }
        }

        let report = self.collector.drain(self.settings.shutdown_grace).await;
        info!(
            evicted = report.evicted,
            failed = report.failed,
            "Process manager stopped"
        );
        report
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
