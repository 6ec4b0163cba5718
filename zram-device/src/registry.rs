//! Multi-device registry — the allocator/lookup table a `zram_add`/
//! `zram_remove`/hot-add-on-module-load control surface sits on top of.
//!
//! Grounded on `zram_index_idr`/`zram_index_mutex`: an index-allocating
//! table serialized by a single mutex. A `BTreeMap` plus a monotonic
//! counter stands in for the IDR; a `TicketLock` stands in for the mutex,
//! consistent with the rest of this crate's O(1)-critical-section lock
//! choices.

use std::collections::BTreeMap;
use std::sync::Arc;

use zram_abi::ZramResult;
use zram_sync::TicketLock;

use crate::device::ZramDevice;

#[derive(Default)]
struct State {
    devices: BTreeMap<u32, Arc<ZramDevice>>,
    next_id: u32,
}

/// A process-wide table of named zram devices, mirroring the
/// `/dev/zram<N>` namespace: `add` hands out the next free index and
/// constructs a fresh, uninitialised device; `remove` tears it down and
/// frees the index for reuse.
pub struct ZramRegistry {
    state: TicketLock<State>,
}

impl Default for ZramRegistry {
    fn default() -> Self {
        Self {
            state: TicketLock::new(State::default()),
        }
    }
}

impl ZramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next free index and register a fresh device under it.
    pub fn add(&self) -> (u32, Arc<ZramDevice>) {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let device = Arc::new(ZramDevice::new());
        state.devices.insert(id, Arc::clone(&device));
        (id, device)
    }

    pub fn get(&self, id: u32) -> Option<Arc<ZramDevice>> {
        self.state.lock().devices.get(&id).cloned()
    }

    /// Reset and drop a device, freeing its index. Errors if no such
    /// device is registered.
    pub fn remove(&self, id: u32) -> ZramResult<()> {
        let mut state = self.state.lock();
        match state.devices.remove(&id) {
            Some(device) => {
                device.reset();
                Ok(())
            }
            None => Err(zram_abi::ZramError::InvalidArgument("no such zram device")),
        }
    }

    /// Reset every registered device without removing it from the
    /// registry, for process-wide teardown (module unload analogue).
    pub fn reset_all(&self) {
        let state = self.state.lock();
        for device in state.devices.values() {
            device.reset();
        }
    }

    pub fn ids(&self) -> Vec<u32> {
        self.state.lock().devices.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_allocates_monotonic_ids() {
        let registry = ZramRegistry::new();
        let (id0, _) = registry.add();
        let (id1, _) = registry.add();
        assert_eq!(id0, 0);
        assert_eq!(id1, 1);
        assert_eq!(registry.ids(), vec![0, 1]);
    }

    #[test]
    fn remove_drops_device_and_rejects_unknown_id() {
        let registry = ZramRegistry::new();
        let (id, _) = registry.add();
        registry.remove(id).unwrap();
        assert!(registry.get(id).is_none());
        assert!(registry.remove(id).is_err());
    }

    #[test]
    fn removed_id_is_not_reused() {
        let registry = ZramRegistry::new();
        let (id0, _) = registry.add();
        registry.remove(id0).unwrap();
        let (id1, _) = registry.add();
        assert_ne!(id0, id1);
    }
}
