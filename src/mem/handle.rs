#![allow(clippy::cast_possible_truncation)]

use crate::heap::{Coherency, CpuMapping, DeviceAddress, HeapBackend, HeapKind, PhysicalLocation};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

const HANDLE_MAGIC: u32 = 0x4857_4d48; // "HWMH"
const HANDLE_FREED: u32 = 0xDEAD_4D48;

// ===============================================================================================
// Public Handle
// ===============================================================================================

/// Opaque reference to a buffer tracked by a [`MemoryManager`](crate::MemoryManager).
///
/// A slot index plus the generation the slot had when the handle was issued, so a
/// handle kept past its release never aliases a later allocation in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemHandle {
    index: u32,
    generation: u32,
}

impl MemHandle {
    /// Never issued; releasing it is a no-op.
    pub const NULL: Self = Self {
        index: 0,
        generation: 0,
    };

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.generation == 0
    }

    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl fmt::Display for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hwmem#{}.{}", self.index, self.generation)
    }
}

/// Point-in-time view of a handle's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleInfo {
    pub size: u32,
    /// Zero until allocated.
    pub alignment: u32,
    pub heap: Option<HeapKind>,
    pub coherency: Option<Coherency>,
    pub pin_count: i32,
    pub ref_count: i32,
    pub mapped: bool,
}

// ===============================================================================================
// Handle State
// ===============================================================================================

/// Backing storage committed by a successful allocation.
#[derive(Debug)]
pub(crate) struct Storage {
    pub heap: Arc<dyn HeapBackend>,
    pub location: PhysicalLocation,
    pub alignment: u32,
    pub coherency: Coherency,

    // Device address programmed by the first pin on a relocatable heap
    pub device: Mutex<Option<DeviceAddress>>,
}

#[derive(Debug)]
pub(crate) struct HandleEntry {
    magic: AtomicU32,
    pub size: u32,
    pub refs: AtomicI32,
    pub pins: AtomicI32,
    pub storage: RwLock<Option<Storage>>,
    pub mapping: Mutex<Option<CpuMapping>>,
}

impl HandleEntry {
    fn new(size: u32) -> Self {
        Self {
            magic: AtomicU32::new(HANDLE_MAGIC),
            size,
            refs: AtomicI32::new(1),
            pins: AtomicI32::new(0),
            storage: RwLock::new(None),
            mapping: Mutex::new(None),
        }
    }

    pub fn is_live(&self) -> bool {
        self.magic.load(Ordering::Acquire) == HANDLE_MAGIC && self.refs.load(Ordering::Acquire) > 0
    }

    /// Takes a reference unless the count already reached zero.
    pub fn try_acquire(&self) -> bool {
        let mut cur = self.refs.load(Ordering::Acquire);
        while cur > 0 {
            match self
                .refs
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
        false
    }

    /// Marks the entry dead; later lookups through stale `Arc`s see it as freed.
    pub fn retire(&self) {
        self.magic.store(HANDLE_FREED, Ordering::Release);
    }

    pub fn info(&self) -> HandleInfo {
        let storage = self.storage.read();
        HandleInfo {
            size: self.size,
            alignment: storage.as_ref().map_or(0, |s| s.alignment),
            heap: storage.as_ref().map(|s| s.heap.kind()),
            coherency: storage.as_ref().map(|s| s.coherency),
            pin_count: self.pins.load(Ordering::Acquire),
            ref_count: self.refs.load(Ordering::Acquire),
            mapped: self.mapping.lock().is_some(),
        }
    }
}

// ===============================================================================================
// Handle Table
// ===============================================================================================

#[derive(Debug)]
struct Slot {
    generation: u32,
    entry: Option<Arc<HandleEntry>>,
}

#[derive(Debug, Default)]
struct TableInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

/// Generation-checked slots holding every live handle.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    inner: RwLock<TableInner>,
}

impl HandleTable {
    pub fn insert(&self, size: u32) -> MemHandle {
        let entry = Arc::new(HandleEntry::new(size));
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.entry = Some(entry);
            MemHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = inner.slots.len() as u32;
            inner.slots.push(Slot {
                generation: 1,
                entry: Some(entry),
            });
            MemHandle {
                index,
                generation: 1,
            }
        }
    }

    pub fn get(&self, handle: MemHandle) -> Option<Arc<HandleEntry>> {
        let inner = self.inner.read();
        let slot = inner.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.clone()
    }

    /// Empties the slot and bumps its generation, invalidating `handle` for good.
    pub fn remove(&self, handle: MemHandle) -> Option<Arc<HandleEntry>> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let slot = inner.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;

        // Generation 0 is reserved for the null handle.
        slot.generation = slot.generation.wrapping_add(1).max(1);
        inner.free.push(handle.index);
        Some(entry)
    }

    pub fn handles(&self) -> Vec<MemHandle> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| MemHandle {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encoding_keeps_generation() {
        let h = MemHandle {
            index: 7,
            generation: 3,
        };
        assert_eq!(MemHandle::from_raw(h.to_raw()), h);
        assert!(!h.is_null());
        assert!(MemHandle::NULL.is_null());
    }

    #[test]
    fn recycled_slot_rejects_stale_handle() {
        let table = HandleTable::default();
        let first = table.insert(64);
        assert!(table.remove(first).is_some());

        let second = table.insert(128);
        assert_eq!(first.index, second.index);
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert_eq!(table.get(second).unwrap().size, 128);
        assert!(table.remove(first).is_none());
    }

    #[test]
    fn acquire_fails_once_count_hits_zero() {
        let entry = HandleEntry::new(16);
        assert!(entry.try_acquire());
        assert_eq!(entry.refs.load(Ordering::Relaxed), 2);

        entry.refs.store(0, Ordering::Relaxed);
        assert!(!entry.try_acquire());
        assert!(!entry.is_live());
    }

    #[test]
    fn handles_lists_only_occupied_slots() {
        let table = HandleTable::default();
        let a = table.insert(1);
        let b = table.insert(2);
        table.remove(a);
        assert_eq!(table.handles(), vec![b]);
    }
}
