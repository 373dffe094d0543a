//! Per-peer-device mutual exclusion.
//!
//! The ratchet is not internally synchronised: two overlapping calls for the
//! same peer device would derive from the same chain index. Hosts that run
//! encrypt/decrypt from several threads take the address lock around each call.

use std::sync::{Arc, Mutex, MutexGuard};

use axolotl_protocol::ProtocolAddress;
use dashmap::DashMap;

#[derive(Default)]
pub struct SessionLocks {
    locks: DashMap<ProtocolAddress, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for one peer device, created on first use.
    pub fn lock_for(&self, address: &ProtocolAddress) -> Arc<Mutex<()>> {
        self.locks
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the lock for `address`.
    pub fn with_lock<T>(&self, address: &ProtocolAddress, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(address);
        let _guard = acquire(&lock);
        f()
    }

    /// Forget the lock of a peer device whose sessions were deleted.
    pub fn remove(&self, address: &ProtocolAddress) {
        self.locks.remove(address);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// A panic inside a previous holder does not corrupt the unit payload.
fn acquire(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
