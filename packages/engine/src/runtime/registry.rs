// packages/engine/src/runtime/registry.rs
//! Fingerprint → worker registry
//!
//! At most one worker exists per fingerprint. Concurrent resolves for an
//! unknown fingerprint coalesce onto a single spawn sequence: the first
//! caller starts it as a detached task and publishes a shared future in
//! `pending`; everybody else awaits that future. Because the sequence runs
//! on its own task, a caller giving up does not abandon a half-started
//! process.

use crate::observability::names;
use crate::runtime::fingerprint::Fingerprint;
use crate::runtime::health::Prober;
use crate::runtime::spawner::{SpawnRequest, Spawner, StopOutcome};
use crate::runtime::worker::{WorkerHandle, WorkerInfo, WorkerLease, WorkerState};
use crate::utils::errors::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

type PendingSpawn = Shared<BoxFuture<'static, Result<Arc<WorkerHandle>>>>;

/// Why a worker is being stopped (metric label)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Idle,
    Shutdown,
    Forced,
    Unreachable,
    StartupFailed,
}

impl EvictionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EvictionReason::Idle => "idle",
            EvictionReason::Shutdown => "shutdown",
            EvictionReason::Forced => "forced",
            EvictionReason::Unreachable => "unreachable",
            EvictionReason::StartupFailed => "startup_failed",
        }
    }
}

/// Timing knobs for the spawn sequence
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub health_poll_interval: Duration,
    pub health_deadline: Duration,
    /// SIGTERM grace for workers torn down by the registry itself
    pub stop_grace: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            health_poll_interval: Duration::from_millis(100),
            health_deadline: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Removes the pending entry when the spawn task finishes, panics included
struct PendingGuard<'a> {
    pending: &'a DashMap<Fingerprint, PendingSpawn>,
    fingerprint: &'a Fingerprint,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.fingerprint);
    }
}

pub struct Registry {
    workers: DashMap<Fingerprint, Arc<WorkerHandle>>,
    pending: DashMap<Fingerprint, PendingSpawn>,
    spawner: Arc<dyn Spawner>,
    prober: Arc<dyn Prober>,
    settings: RegistrySettings,
    closed: AtomicBool,
}

impl Registry {
    pub fn new(
        spawner: Arc<dyn Spawner>,
        prober: Arc<dyn Prober>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            workers: DashMap::new(),
            pending: DashMap::new(),
            spawner,
            prober,
            settings,
            closed: AtomicBool::new(false),
        }
    }

    /// Lease the ready worker for `fingerprint`, spawning one if needed
    pub async fn resolve(
        self: &Arc<Self>,
        fingerprint: &Fingerprint,
        source: &str,
    ) -> Result<WorkerLease> {
        loop {
            if self.is_closed() {
                return Err(EngineError::ShuttingDown);
            }
            if let Some(lease) = self.lease_existing(fingerprint) {
                trace!(fingerprint = %fingerprint.short(), "Reusing ready worker");
                return Ok(lease);
            }

            let spawn = match self.pending.entry(fingerprint.clone()) {
                Entry::Occupied(entry) => {
                    debug!(fingerprint = %fingerprint.short(), "Joining in-flight spawn");
                    entry.get().clone()
                }
                Entry::Vacant(entry) => {
                    // A spawn may have completed between the fast path and taking the entry
                    if let Some(lease) = self.lease_existing(fingerprint) {
                        return Ok(lease);
                    }
                    let spawn = self.start_spawn(fingerprint.clone(), source.to_string());
                    entry.insert(spawn.clone());
                    spawn
                }
            };

            let handle = spawn.await?;
            if let Some(lease) = WorkerLease::acquire(&handle) {
                return Ok(lease);
            }
            debug!(
                fingerprint = %fingerprint.short(),
                state = %handle.state(),
                "Spawned worker left ready state before acquisition, retrying"
            );
        }
    }

    /// Return a lease; equivalent to dropping it
    pub fn release(&self, lease: WorkerLease) {
        trace!(fingerprint = %lease.fingerprint().short(), "Releasing worker");
        drop(lease);
    }

    fn lease_existing(&self, fingerprint: &Fingerprint) -> Option<WorkerLease> {
        let handle = self.workers.get(fingerprint).map(|entry| Arc::clone(entry.value()))?;
        WorkerLease::acquire(&handle)
    }

    fn start_spawn(self: &Arc<Self>, fingerprint: Fingerprint, source: String) -> PendingSpawn {
        let registry = Arc::clone(self);
        let task = tokio::spawn(async move { registry.create(fingerprint, source).await });

        async move {
            task.await
                .unwrap_or_else(|e| Err(EngineError::Spawn(format!("spawn task aborted: {}", e))))
        }
        .boxed()
        .shared()
    }

    async fn create(
        self: Arc<Self>,
        fingerprint: Fingerprint,
        source: String,
    ) -> Result<Arc<WorkerHandle>> {
        let _pending = PendingGuard {
            pending: &self.pending,
            fingerprint: &fingerprint,
        };
        let started = Instant::now();

        let result = self.spawn_and_probe(&fingerprint, &source).await;

        match &result {
            Ok(handle) => {
                metrics::counter!(names::SPAWNS_TOTAL, "outcome" => "ready").increment(1);
                metrics::histogram!(names::READY_SECONDS).record(started.elapsed().as_secs_f64());
                info!(
                    fingerprint = %fingerprint.short(),
                    endpoint = %handle.endpoint(),
                    ready_ms = started.elapsed().as_millis() as u64,
                    "Worker ready"
                );
            }
            Err(e) => {
                metrics::counter!(names::SPAWNS_TOTAL, "outcome" => e.kind()).increment(1);
                warn!(fingerprint = %fingerprint.short(), error = %e, "Worker failed to start");
            }
        }

        result
    }

    async fn spawn_and_probe(
        &self,
        fingerprint: &Fingerprint,
        source: &str,
    ) -> Result<Arc<WorkerHandle>> {
        let spawned = self
            .spawner
            .spawn(SpawnRequest {
                fingerprint,
                source,
                port_hint: fingerprint.port_hint(),
            })
            .await?;

        let handle = Arc::new(WorkerHandle::new(fingerprint.clone(), &spawned));
        self.workers.insert(fingerprint.clone(), Arc::clone(&handle));
        self.record_population();

        handle.transition(WorkerState::HealthChecking);
        let probe = self
            .prober
            .wait_until_ready(
                handle.endpoint(),
                self.settings.health_poll_interval,
                self.settings.health_deadline,
            )
            .await;

        if let Err(e) = probe {
            handle.transition(WorkerState::Failed);
            self.stop_quietly(&handle, EvictionReason::StartupFailed).await;
            return Err(e);
        }

        if self.is_closed() || !handle.transition(WorkerState::Ready) {
            handle.transition(WorkerState::Failed);
            self.stop_quietly(&handle, EvictionReason::Shutdown).await;
            return Err(EngineError::ShuttingDown);
        }

        Ok(handle)
    }

    /// Stop a worker the caller has already moved to `Terminating` or `Failed`
    pub async fn evict(
        &self,
        handle: &Arc<WorkerHandle>,
        grace: Duration,
        reason: EvictionReason,
    ) -> Result<()> {
        let state = handle.state();
        if !matches!(state, WorkerState::Terminating | WorkerState::Failed) {
            return Err(EngineError::Eviction(format!(
                "worker {} is {}, not terminating",
                handle.fingerprint().short(),
                state
            )));
        }

        match self.terminate(handle, grace, reason).await {
            Ok(StopOutcome::Killed) => Err(EngineError::Eviction(format!(
                "worker {} ignored SIGTERM for {:?} and was killed",
                handle.fingerprint().short(),
                grace
            ))),
            Ok(outcome) => {
                info!(
                    fingerprint = %handle.fingerprint().short(),
                    reason = reason.as_str(),
                    outcome = ?outcome,
                    "Worker evicted"
                );
                Ok(())
            }
            Err(EngineError::Eviction(msg)) => Err(EngineError::Eviction(msg)),
            Err(e) => Err(EngineError::Eviction(format!(
                "stopping worker {}: {}",
                handle.fingerprint().short(),
                e
            ))),
        }
    }

    /// Drop an unreachable worker; the next resolve spawns a replacement
    pub fn discard(self: &Arc<Self>, handle: &Arc<WorkerHandle>) {
        handle.transition(WorkerState::Failed);
        self.unregister(handle);
        warn!(
            fingerprint = %handle.fingerprint().short(),
            endpoint = %handle.endpoint(),
            "Discarded unreachable worker"
        );

        let registry = Arc::clone(self);
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            registry.stop_quietly(&handle, EvictionReason::Unreachable).await;
        });
    }

    async fn stop_quietly(&self, handle: &Arc<WorkerHandle>, reason: EvictionReason) {
        if let Err(e) = self.terminate(handle, self.settings.stop_grace, reason).await {
            warn!(fingerprint = %handle.fingerprint().short(), error = %e, "Failed to stop worker");
        }
    }

    /// Unregister and stop; the spawner is asked at most once per handle
    async fn terminate(
        &self,
        handle: &Arc<WorkerHandle>,
        grace: Duration,
        reason: EvictionReason,
    ) -> Result<StopOutcome> {
        self.unregister(handle);

        if !handle.claim_stop() {
            return Ok(StopOutcome::AlreadyStopped);
        }

        let outcome = self.spawner.stop(handle.process_id(), grace).await;
        handle.transition(WorkerState::Terminated);
        metrics::counter!(names::EVICTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        outcome
    }

    /// Remove `handle` only if it is still the registered worker for its fingerprint
    fn unregister(&self, handle: &Arc<WorkerHandle>) {
        let removed = self
            .workers
            .remove_if(handle.fingerprint(), |_, current| Arc::ptr_eq(current, handle));
        if removed.is_some() {
            self.record_population();
        }
    }

    fn record_population(&self) {
        metrics::gauge!(names::WORKERS).set(self.workers.len() as f64);
    }

    /// Metadata for every registered worker, oldest first
    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .workers
            .iter()
            .map(|entry| entry.value().info())
            .collect();
        infos.sort_by(|a, b| {
            a.spawned_at
                .cmp(&b.spawned_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        infos
    }

    pub(crate) fn handles(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<WorkerHandle>> {
        self.workers.get(fingerprint).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn pending_spawns(&self) -> usize {
        self.pending.len()
    }

    /// Refuse all further acquisitions
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(workers = self.workers.len(), "Registry closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{MockProber, MockSpawner, ProbeScript};

    fn registry(spawner: Arc<MockSpawner>, script: ProbeScript) -> Arc<Registry> {
        Arc::new(Registry::new(
            spawner,
            Arc::new(MockProber::new(script)),
            RegistrySettings {
                health_poll_interval: Duration::from_millis(10),
                health_deadline: Duration::from_millis(200),
                stop_grace: Duration::from_millis(100),
            },
        ))
    }

    #[tokio::test]
    async fn test_resolve_spawns_once_and_reuses() {
        let spawner = Arc::new(MockSpawner::new());
        let registry = registry(Arc::clone(&spawner), ProbeScript::Ready);
        let fp = Fingerprint::of("a");

        let first = registry.resolve(&fp, "a").await.unwrap();
        let endpoint = first.endpoint();
        registry.release(first);

        let second = registry.resolve(&fp, "a").await.unwrap();
        assert_eq!(second.endpoint(), endpoint);
        assert_eq!(spawner.spawn_count(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.pending_spawns(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_coalesce() {
        let spawner = Arc::new(MockSpawner::new().with_delay(Duration::from_millis(200)));
        let registry = registry(Arc::clone(&spawner), ProbeScript::Ready);
        let fp = Fingerprint::of("shared");

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let fp = fp.clone();
                tokio::spawn(async move {
                    registry
                        .resolve(&fp, "shared")
                        .await
                        .map(|l| l.endpoint())
                })
            })
            .collect();

        let endpoints: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(spawner.spawn_count(), 1);
        assert!(endpoints.iter().all(|e| *e == endpoints[0]));
        assert_eq!(registry.get(&fp).unwrap().ref_count(), 0);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_get_distinct_workers() {
        let spawner = Arc::new(MockSpawner::new());
        let registry = registry(Arc::clone(&spawner), ProbeScript::Ready);

        let a = registry.resolve(&Fingerprint::of("a"), "a").await.unwrap();
        let b = registry.resolve(&Fingerprint::of("b"), "b").await.unwrap();

        assert_ne!(a.endpoint(), b.endpoint());
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_health_timeout_cleans_up() {
        let spawner = Arc::new(MockSpawner::new());
        let registry = registry(Arc::clone(&spawner), ProbeScript::Never);
        let fp = Fingerprint::of("slow");

        let err = registry.resolve(&fp, "slow").await.unwrap_err();
        assert_eq!(err.kind(), "health_timeout");
        assert!(registry.is_empty());
        assert_eq!(registry.pending_spawns(), 0);
        assert_eq!(spawner.live_count(), 0);
        assert_eq!(spawner.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure_shared_by_waiters() {
        let spawner = Arc::new(
            MockSpawner::new()
                .with_delay(Duration::from_millis(50))
                .failing(),
        );
        let registry = registry(Arc::clone(&spawner), ProbeScript::Ready);
        let fp = Fingerprint::of("broken");

        let (a, b) = tokio::join!(registry.resolve(&fp, "broken"), registry.resolve(&fp, "broken"));
        assert_eq!(a.unwrap_err().kind(), "spawn");
        assert_eq!(b.unwrap_err().kind(), "spawn");
        assert_eq!(spawner.spawn_count(), 1);

        // Failures are not cached
        let _ = registry.resolve(&fp, "broken").await;
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_registry_refuses() {
        let spawner = Arc::new(MockSpawner::new());
        let registry = registry(Arc::clone(&spawner), ProbeScript::Ready);
        registry.close();

        let err = registry.resolve(&Fingerprint::of("x"), "x").await.unwrap_err();
        assert!(matches!(err, EngineError::ShuttingDown));
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_close_during_probe_fails_spawn() {
        let spawner = Arc::new(MockSpawner::new());
        let registry = registry(
            Arc::clone(&spawner),
            ProbeScript::ReadyAfter(Duration::from_millis(100)),
        );
        let fp = Fingerprint::of("late");

        let resolving = {
            let registry = Arc::clone(&registry);
            let fp = fp.clone();
            tokio::spawn(async move { registry.resolve(&fp, "late").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.close();

        let err = resolving.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::ShuttingDown));
        assert_eq!(spawner.live_count(), 0);
    }

    #[tokio::test]
    async fn test_evict_requires_terminating() {
        let spawner = Arc::new(MockSpawner::new());
        let registry = registry(Arc::clone(&spawner), ProbeScript::Ready);
        let fp = Fingerprint::of("e");

        let lease = registry.resolve(&fp, "e").await.unwrap();
        let handle = Arc::clone(lease.handle());
        drop(lease);

        let err = registry
            .evict(&handle, Duration::from_millis(10), EvictionReason::Idle)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "eviction");
        assert_eq!(registry.len(), 1);

        assert!(handle.try_begin_drain());
        registry
            .evict(&handle, Duration::from_millis(10), EvictionReason::Idle)
            .await
            .unwrap();
        assert!(registry.is_empty());
        assert_eq!(handle.state(), WorkerState::Terminated);
        assert_eq!(spawner.stop_count(), 1);

        // Second eviction does not stop the process again
        registry
            .evict(&handle, Duration::from_millis(10), EvictionReason::Idle)
            .await
            .unwrap_err();
        assert_eq!(spawner.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_discard_then_respawn() {
        let spawner = Arc::new(MockSpawner::new());
        let registry = registry(Arc::clone(&spawner), ProbeScript::Ready);
        let fp = Fingerprint::of("d");

        let lease = registry.resolve(&fp, "d").await.unwrap();
        let old = lease.endpoint();
        let handle = Arc::clone(lease.handle());
        registry.discard(lease.handle());
        assert!(registry.is_empty());
        drop(lease);

        // The background stop has not run yet; the use count is already back
        assert_eq!(handle.ref_count(), 0);
        assert_eq!(handle.state(), WorkerState::Failed);

        let lease = registry.resolve(&fp, "d").await.unwrap();
        assert_ne!(lease.endpoint(), old);
        assert_eq!(spawner.spawn_count(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(spawner.stop_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_lists_workers() {
        let spawner = Arc::new(MockSpawner::new());
        let registry = registry(Arc::clone(&spawner), ProbeScript::Ready);

        let _a = registry.resolve(&Fingerprint::of("a"), "a").await.unwrap();
        let _b = registry.resolve(&Fingerprint::of("b"), "b").await.unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|w| w.state == WorkerState::Ready && w.ref_count == 1));
    }
}
