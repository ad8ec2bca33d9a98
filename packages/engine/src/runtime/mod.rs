// packages/engine/src/runtime/mod.rs
//! Worker process runtime
//!
//! This module keeps one warm runtime process per distinct code unit:
//!
//! - **Fingerprint**: content hash that keys workers
//! - **Spawner**: launches and stops OS processes (working dir, port, env)
//! - **Health**: readiness probing of fresh workers
//! - **Registry**: fingerprint → worker map with spawn coalescing and leases
//! - **Proxy**: forwards invocation payloads with a deadline
//! - **GC**: idle eviction and shutdown drain
//! - **Manager**: facade the adapters talk to
//!
//! # Architecture
//!
//! ```text
//!            invoke(identity, source, payload)
//!                         │
//!                 ┌───────▼────────┐
//!                 │ ProcessManager │
//!                 └───┬────────┬───┘
//!          resolve    │        │   forward
//!        ┌────────────▼──┐  ┌──▼───────────┐
//!        │   Registry    │  │ RequestProxy │──── HTTP ───┐
//!        │ fp → Worker   │  └──────────────┘             │
//!        └──┬─────────▲──┘                               │
//!   spawn   │         │ evict                   ┌────────▼────────┐
//!  ┌────────▼──┐   ┌──┴──────────────┐          │ worker process  │
//!  │  Spawner  │   │GarbageCollector │          │ 127.0.0.1:port  │
//!  │ + Prober  │   └─────────────────┘          └─────────────────┘
//!  └───────────┘
//! ```

pub mod fingerprint;
pub mod gc;
pub mod health;
pub mod manager;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod spawner;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use fingerprint::Fingerprint;
pub use gc::{GarbageCollector, SweepReport};
pub use health::{HttpProber, Prober};
pub use manager::{ManagerSettings, ProcessManager};
pub use ports::PortAllocator;
pub use proxy::{RequestProxy, WorkerResponse};
pub use registry::{EvictionReason, Registry, RegistrySettings};
pub use spawner::{ProcessId, ProcessSpawner, SpawnRequest, SpawnedWorker, Spawner, StopOutcome};
pub use worker::{WorkerHandle, WorkerInfo, WorkerLease, WorkerState, WorkerSummary};
