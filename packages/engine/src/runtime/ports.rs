// packages/engine/src/runtime/ports.rs
//! Loopback port assignment for workers
//!
//! Ports come from `[base, base + range)`. A port is handed out only if no
//! live worker holds it and it can currently be bound on 127.0.0.1, so a
//! foreign process squatting in the range is skipped rather than collided
//! with.

use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use tracing::{debug, trace};

/// Port allocator shared by all spawns
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    range: u16,
    check_bindable: bool,
    assigned: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator over `[base, base + range)`
    pub fn new(base: u16, range: u16) -> Self {
        Self {
            base,
            range,
            check_bindable: true,
            assigned: Mutex::new(BTreeSet::new()),
        }
    }

    /// Skip the loopback bind check (bookkeeping only)
    pub fn without_bind_check(mut self) -> Self {
        self.check_bindable = false;
        self
    }

    /// Assign a free port, preferring `base + hint % range`
    pub fn allocate(&self, hint: u16) -> Result<u16> {
        let range = u32::from(self.range);
        if range == 0 {
            return Err(EngineError::Spawn("worker port range is empty".to_string()));
        }

        let mut assigned = self.assigned.lock();
        let start = u32::from(hint) % range;

        for step in 0..range {
            let offset = (start + step) % range;
            let candidate = u32::from(self.base) + offset;
            let Ok(port) = u16::try_from(candidate) else {
                continue;
            };

            if assigned.contains(&port) {
                continue;
            }
            if self.check_bindable && !Self::is_bindable(port) {
                trace!(port, "Port in use by another process, skipping");
                continue;
            }

            assigned.insert(port);
            debug!(port, "Assigned worker port");
            return Ok(port);
        }

        Err(EngineError::Spawn(format!(
            "no free port in {}..{}",
            self.base,
            u32::from(self.base) + range
        )))
    }

    /// Return a port to the pool; releasing an unassigned port is a no-op
    pub fn release(&self, port: u16) {
        if self.assigned.lock().remove(&port) {
            debug!(port, "Released worker port");
        }
    }

    /// Number of ports currently assigned
    pub fn in_use(&self) -> usize {
        self.assigned.lock().len()
    }

    fn is_bindable(port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }
}
