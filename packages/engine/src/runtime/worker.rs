// packages/engine/src/runtime/worker.rs
//! Worker handles and their lifecycle state machine
//!
//! ```text
//! Starting → HealthChecking → Ready → Terminating → Terminated
//!     └───────────┴─────────────┴──────────┴──→ Failed
//! ```
//!
//! `state`, `ref_count` and `last_used` live behind one lock so that the
//! acquisition path and the garbage collector agree on "ready and unused":
//! once a handle is moved to `Terminating` no further lease can be taken on it.

use crate::runtime::fingerprint::Fingerprint;
use crate::runtime::spawner::{ProcessId, SpawnedWorker};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use ulid::Ulid;

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process launched, endpoint allocated, not yet probed
    Starting,
    /// Readiness probe in progress
    HealthChecking,
    /// Serving traffic
    Ready,
    /// Termination initiated, no new acquisitions
    Terminating,
    Terminated,
    Failed,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::HealthChecking => "health_checking",
            WorkerState::Ready => "ready",
            WorkerState::Terminating => "terminating",
            WorkerState::Terminated => "terminated",
            WorkerState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminated | WorkerState::Failed)
    }

    fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;

        match (self, next) {
            (Terminated, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Starting, HealthChecking)
            | (HealthChecking, Ready)
            | (Ready, Terminating)
            | (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-handle bookkeeping
#[derive(Debug)]
struct Usage {
    state: WorkerState,
    ref_count: usize,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    invocations: u64,
    consecutive_timeouts: u32,
}

/// One spawned runtime instance
#[derive(Debug)]
pub struct WorkerHandle {
    id: Ulid,
    fingerprint: Fingerprint,
    endpoint: SocketAddr,
    process_id: ProcessId,
    os_pid: Option<u32>,
    spawned_at: DateTime<Utc>,
    usage: Mutex<Usage>,
    /// Set by whichever path first issues the spawner stop
    stop_claimed: AtomicBool,
}

impl WorkerHandle {
    pub(crate) fn new(fingerprint: Fingerprint, spawned: &SpawnedWorker) -> Self {
        let now = Utc::now();

        Self {
            id: Ulid::new(),
            fingerprint,
            endpoint: spawned.endpoint,
            process_id: spawned.process_id,
            os_pid: spawned.os_pid,
            spawned_at: now,
            usage: Mutex::new(Usage {
                state: WorkerState::Starting,
                ref_count: 0,
                last_used: Instant::now(),
                last_used_at: now,
                invocations: 0,
                consecutive_timeouts: 0,
            }),
            stop_claimed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub(crate) fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn state(&self) -> WorkerState {
        self.usage.lock().state
    }

    pub fn ref_count(&self) -> usize {
        self.usage.lock().ref_count
    }

    /// Time since the last invocation completed (or since readiness)
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.usage.lock().last_used)
    }

    /// Apply a state-machine transition; illegal transitions are refused
    pub(crate) fn transition(&self, next: WorkerState) -> bool {
        let mut usage = self.usage.lock();
        let current = usage.state;

        if !current.can_transition_to(next) {
            trace!(
                fingerprint = %self.fingerprint.short(),
                from = %current,
                to = %next,
                "Refused worker state transition"
            );
            return false;
        }

        usage.state = next;
        if next == WorkerState::Ready {
            usage.last_used = Instant::now();
            usage.last_used_at = Utc::now();
        }

        debug!(
            fingerprint = %self.fingerprint.short(),
            endpoint = %self.endpoint,
            from = %current,
            to = %next,
            "Worker state changed"
        );
        true
    }

    /// Take a reference if the worker is ready
    fn try_acquire(&self) -> bool {
        let mut usage = self.usage.lock();
        if usage.state != WorkerState::Ready {
            return false;
        }
        usage.ref_count += 1;
        usage.invocations += 1;
        true
    }

    fn release(&self) {
        let mut usage = self.usage.lock();
        debug_assert!(usage.ref_count > 0, "worker released more often than acquired");
        usage.ref_count = usage.ref_count.saturating_sub(1);
        usage.last_used = Instant::now();
        usage.last_used_at = Utc::now();
    }

    /// Track consecutive request timeouts; any success resets the streak
    pub(crate) fn record_outcome(&self, timed_out: bool) {
        let mut usage = self.usage.lock();
        if timed_out {
            usage.consecutive_timeouts = usage.consecutive_timeouts.saturating_add(1);
        } else {
            usage.consecutive_timeouts = 0;
        }
    }

    /// Move to `Terminating` if ready, unreferenced and idle strictly longer than `idle_timeout`
    pub(crate) fn try_begin_idle_eviction(&self, idle_timeout: Duration) -> bool {
        let mut usage = self.usage.lock();
        let idle = Instant::now().saturating_duration_since(usage.last_used);

        if usage.state == WorkerState::Ready && usage.ref_count == 0 && idle > idle_timeout {
            usage.state = WorkerState::Terminating;
            return true;
        }
        false
    }

    /// Move to `Terminating` if ready and unreferenced, regardless of idle time
    pub(crate) fn try_begin_drain(&self) -> bool {
        let mut usage = self.usage.lock();

        if usage.state == WorkerState::Ready && usage.ref_count == 0 {
            usage.state = WorkerState::Terminating;
            return true;
        }
        false
    }

    /// Returns true exactly once per handle
    pub(crate) fn claim_stop(&self) -> bool {
        !self.stop_claimed.swap(true, Ordering::AcqRel)
    }

    /// Point-in-time metadata
    pub fn info(&self) -> WorkerInfo {
        let usage = self.usage.lock();

        WorkerInfo {
            id: self.id.to_string(),
            fingerprint: self.fingerprint.clone(),
            state: usage.state,
            endpoint: self.endpoint,
            pid: self.os_pid,
            ref_count: usage.ref_count,
            invocations: usage.invocations,
            consecutive_timeouts: usage.consecutive_timeouts,
            spawned_at: self.spawned_at,
            last_used_at: usage.last_used_at,
            idle_ms: Instant::now()
                .saturating_duration_since(usage.last_used)
                .as_millis() as u64,
        }
    }
}

/// A counted reference to a ready worker
///
/// The reference is returned when the lease is dropped, so every exit path
/// of an invocation (success, error, cancellation) releases it exactly once.
#[derive(Debug)]
pub struct WorkerLease {
    handle: Arc<WorkerHandle>,
}

impl WorkerLease {
    /// Lease `handle` if it is ready
    pub(crate) fn acquire(handle: &Arc<WorkerHandle>) -> Option<Self> {
        handle.try_acquire().then(|| Self {
            handle: Arc::clone(handle),
        })
    }

    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.handle.endpoint
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.handle.fingerprint
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.handle.release();
    }
}

/// Serializable worker metadata for introspection
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub fingerprint: Fingerprint,
    pub state: WorkerState,
    pub endpoint: SocketAddr,
    pub pid: Option<u32>,
    pub ref_count: usize,
    pub invocations: u64,
    pub consecutive_timeouts: u32,
    pub spawned_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub idle_ms: u64,
}

/// Worker counts by state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub total: usize,
    pub starting: usize,
    pub health_checking: usize,
    pub ready: usize,
    pub terminating: usize,
    pub terminated: usize,
    pub failed: usize,
    /// Workers with at least one in-flight invocation
    pub busy: usize,
    /// Spawn sequences not yet resolved
    pub pending_spawns: usize,
}

impl WorkerSummary {
    pub fn from_infos(infos: &[WorkerInfo], pending_spawns: usize) -> Self {
        let mut summary = WorkerSummary {
            total: infos.len(),
            pending_spawns,
            ..Default::default()
        };

        for info in infos {
            match info.state {
                WorkerState::Starting => summary.starting += 1,
                WorkerState::HealthChecking => summary.health_checking += 1,
                WorkerState::Ready => summary.ready += 1,
                WorkerState::Terminating => summary.terminating += 1,
                WorkerState::Terminated => summary.terminated += 1,
                WorkerState::Failed => summary.failed += 1,
            }
            if info.ref_count > 0 {
                summary.busy += 1;
            }
        }

        summary
    }
}
