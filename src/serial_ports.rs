//! Arbitration of the hardware UARTs between providers.
//!
//! Supported targets expose three hardware serial controllers. Providers
//! that need one (VE.Direct instances, serial meters) request a slot by
//! owner name and release it on teardown. Duplicate allocation attempts by
//! the same owner are absorbed into a rejects set so a provider cannot leak
//! slots across configuration reloads.

use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{debug, warn};

const NUM_CONTROLLERS: usize = 3;

#[derive(Debug, Default)]
pub struct SerialPortAllocator {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    ports: [Option<String>; NUM_CONTROLLERS],
    rejects: HashSet<String>,
}

impl SerialPortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an unused slot index, or `None` if all ports are taken or the
    /// owner already holds one.
    pub fn allocate_port(&self, owner: &str) -> Option<usize> {
        let mut inner = self.inner.lock();

        if inner.ports.iter().flatten().any(|held| held == owner) {
            inner.rejects.insert(owner.to_string());
            warn!(owner, "serial port already allocated to this owner");
            return None;
        }

        for (index, slot) in inner.ports.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(owner.to_string());
                debug!(owner, index, "serial port allocated");
                return Some(index);
            }
        }

        warn!(owner, "no serial port left to allocate");
        None
    }

    /// Clears the slot iff it is currently held by `owner`.
    pub fn free_port(&self, owner: &str) {
        let mut inner = self.inner.lock();

        inner.rejects.remove(owner);

        for slot in inner.ports.iter_mut() {
            if slot.as_deref() == Some(owner) {
                *slot = None;
                debug!(owner, "serial port freed");
                return;
            }
        }
    }

    pub fn allocations(&self) -> Vec<(usize, Option<String>)> {
        let inner = self.inner.lock();
        inner
            .ports
            .iter()
            .cloned()
            .enumerate()
            .collect()
    }
}
