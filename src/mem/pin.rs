use super::handle::{HandleEntry, MemHandle};
use super::manager::MemoryManager;
use crate::error::{MemError, MemResult};
use crate::heap::{DeviceAddress, INVALID_ADDRESS};
use crate::invariant_violation;
use std::sync::atomic::Ordering;

impl MemoryManager {
    /// Takes a pin on `handle` and returns the device address of its first byte.
    ///
    /// The address stays valid until the matching [`unpin`](Self::unpin). On relocatable
    /// heaps the first pin programs the translation; later pins reuse it.
    ///
    /// # Errors
    /// `BadValue` for a released or unallocated handle, or the heap's error if the
    /// translation cannot be set up. The pin is not taken on error.
    pub fn pin(&self, handle: MemHandle) -> MemResult<DeviceAddress> {
        let entry = self.lookup(handle)?;

        let prev = entry.pins.fetch_add(1, Ordering::AcqRel);
        if prev < 0 {
            invariant_violation!("{handle}: pin count was negative ({prev})");
        }

        match Self::resolve_pinned(&entry) {
            Ok(addr) => {
                log::trace!("{handle}: pinned ({}) at 0x{addr:x}", prev + 1);
                Ok(addr)
            }
            Err(e) => {
                entry.pins.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    pub fn unpin(&self, handle: MemHandle) {
        let Some(entry) = self.expect_entry(handle, "unpin") else {
            return;
        };

        let prev = entry.pins.fetch_sub(1, Ordering::AcqRel);
        if prev < 1 {
            entry.pins.fetch_add(1, Ordering::AcqRel);
            invariant_violation!("{handle}: unpin without matching pin");
            return;
        }
        log::trace!("{handle}: unpinned ({})", prev - 1);
    }

    /// Pins every handle in order. On failure the pins already taken are dropped again.
    ///
    /// # Errors
    /// The first error [`pin`](Self::pin) reports.
    pub fn pin_many(&self, handles: &[MemHandle]) -> MemResult<Vec<DeviceAddress>> {
        let mut addrs = Vec::with_capacity(handles.len());

        for (idx, &handle) in handles.iter().enumerate() {
            match self.pin(handle) {
                Ok(addr) => addrs.push(addr),
                Err(e) => {
                    self.unpin_many(&handles[..idx]);
                    return Err(e);
                }
            }
        }
        Ok(addrs)
    }

    pub fn unpin_many(&self, handles: &[MemHandle]) {
        for &handle in handles {
            self.unpin(handle);
        }
    }

    /// Device address of `offset` within `handle`.
    ///
    /// Only meaningful while the handle is pinned, unless its heap never relocates.
    /// Returns [`INVALID_ADDRESS`] for unallocated handles and out-of-range offsets.
    #[must_use]
    pub fn get_address(&self, handle: MemHandle, offset: u32) -> DeviceAddress {
        let Some(entry) = self.expect_entry(handle, "get_address") else {
            return INVALID_ADDRESS;
        };
        if offset >= entry.size {
            return INVALID_ADDRESS;
        }

        let storage = entry.storage.read();
        let Some(storage) = storage.as_ref() else {
            return INVALID_ADDRESS;
        };

        if !storage.heap.descriptor().fixed_address
            && let Some(base) = *storage.device.lock()
        {
            return base + u64::from(offset);
        }
        storage.heap.resolve_address(&storage.location, offset as usize)
    }

    #[must_use]
    pub fn pin_count(&self, handle: MemHandle) -> i32 {
        self.expect_entry(handle, "pin_count")
            .map_or(0, |e| e.pins.load(Ordering::Acquire))
    }

    fn resolve_pinned(entry: &HandleEntry) -> MemResult<DeviceAddress> {
        let storage = entry.storage.read();
        let storage = storage
            .as_ref()
            .ok_or_else(|| MemError::BadValue("pin of unallocated handle".to_string()))?;

        if storage.heap.descriptor().fixed_address {
            return Ok(storage.heap.resolve_address(&storage.location, 0));
        }

        let mut device = storage.device.lock();
        if let Some(addr) = *device {
            return Ok(addr);
        }
        let addr = storage.heap.map_pages(&storage.location)?;
        *device = Some(addr);
        Ok(addr)
    }
}
