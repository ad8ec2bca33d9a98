// packages/engine/src/runtime/gc.rs
//! Idle-worker garbage collection and shutdown drain

use crate::runtime::registry::{EvictionReason, Registry};
use crate::runtime::worker::{WorkerHandle, WorkerState};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// How often a drain re-checks busy workers
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Shortest sweep period; `tokio::time::interval` rejects zero
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one sweep or drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub evicted: usize,
    /// Skipped because an invocation held a reference
    pub busy: usize,
    /// Evictions that did not complete cleanly
    pub failed: usize,
}

impl SweepReport {
    fn merge(&mut self, other: SweepReport) {
        self.examined = self.examined.max(other.examined);
        self.evicted += other.evicted;
        self.busy = other.busy;
        self.failed += other.failed;
    }
}

/// Periodic sweeper that evicts ready workers idle longer than the timeout
pub struct GarbageCollector {
    registry: Arc<Registry>,
    interval: Duration,
    idle_timeout: Duration,
    stop_grace: Duration,
}

impl GarbageCollector {
    pub fn new(
        registry: Arc<Registry>,
        interval: Duration,
        idle_timeout: Duration,
        stop_grace: Duration,
    ) -> Self {
        if interval < MIN_INTERVAL {
            warn!(
                "Garbage collector interval {:?} is below {:?}, clamping",
                interval, MIN_INTERVAL
            );
        }
        Self {
            registry,
            interval: interval.max(MIN_INTERVAL),
            idle_timeout,
            stop_grace,
        }
    }

    /// Run sweeps every `interval` until `shutdown` is cancelled
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Garbage collector started (interval {:?}, idle timeout {:?})",
                self.interval, self.idle_timeout
            );

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Garbage collector stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.sweep().await;
                        if report.evicted > 0 || report.failed > 0 {
                            info!(
                                examined = report.examined,
                                evicted = report.evicted,
                                busy = report.busy,
                                failed = report.failed,
                                "Garbage collection sweep"
                            );
                        } else {
                            trace!(
                                examined = report.examined,
                                busy = report.busy,
                                "Nothing to collect"
                            );
                        }
                    }
                }
            }
        })
    }

    /// Evict every ready, unreferenced worker idle strictly longer than the timeout
    pub async fn sweep(&self) -> SweepReport {
        let handles = self.registry.handles();
        let mut report = SweepReport {
            examined: handles.len(),
            ..Default::default()
        };

        let mut victims = Vec::new();
        for handle in handles {
            if handle.try_begin_idle_eviction(self.idle_timeout) {
                victims.push(handle);
            } else if handle.ref_count() > 0 {
                report.busy += 1;
            }
        }

        self.evict_all(&victims, self.stop_grace, EvictionReason::Idle, &mut report)
            .await;
        report
    }

    /// Stop every worker, waiting up to `grace` for in-flight invocations
    ///
    /// Idle workers are stopped as soon as they are seen. Busy workers are
    /// re-checked until they go idle or the deadline passes; whatever is left
    /// then is killed.
    pub async fn drain(&self, grace: Duration) -> SweepReport {
        let deadline = Instant::now() + grace;
        let mut report = SweepReport::default();

        loop {
            let handles = self.registry.handles();
            if handles.is_empty() && self.registry.pending_spawns() == 0 {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    remaining = handles.len(),
                    pending = self.registry.pending_spawns(),
                    "Drain deadline reached, killing remaining workers"
                );
                report.merge(self.force(handles).await);
                break;
            }

            let mut pass = SweepReport {
                examined: handles.len(),
                ..Default::default()
            };
            let mut victims = Vec::new();
            for handle in handles {
                if handle.try_begin_drain() {
                    victims.push(handle);
                } else if handle.ref_count() > 0 {
                    pass.busy += 1;
                }
            }

            let remaining = deadline.saturating_duration_since(now);
            self.evict_all(
                &victims,
                self.stop_grace.min(remaining),
                EvictionReason::Shutdown,
                &mut pass,
            )
            .await;
            report.merge(pass);

            if victims.is_empty() {
                tokio::time::sleep(DRAIN_POLL.min(remaining)).await;
            }
        }

        report
    }

    async fn force(&self, handles: Vec<Arc<WorkerHandle>>) -> SweepReport {
        let mut report = SweepReport {
            examined: handles.len(),
            ..Default::default()
        };
        for handle in &handles {
            handle.transition(WorkerState::Failed);
        }
        self.evict_all(&handles, Duration::ZERO, EvictionReason::Forced, &mut report)
            .await;
        report
    }

    async fn evict_all(
        &self,
        victims: &[Arc<WorkerHandle>],
        grace: Duration,
        reason: EvictionReason,
        report: &mut SweepReport,
    ) {
        if victims.is_empty() {
            return;
        }

        let results = join_all(
            victims
                .iter()
                .map(|handle| self.registry.evict(handle, grace, reason)),
        )
        .await;

        for (handle, result) in victims.iter().zip(results) {
            match result {
                Ok(()) => report.evicted += 1,
                Err(e) => {
                    report.failed += 1;
                    error!(
                        fingerprint = %handle.fingerprint().short(),
                        error = %e,
                        "Eviction failed"
                    );
                }
            }
        }
    }
}
