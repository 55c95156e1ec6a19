use super::handle::{HandleEntry, MemHandle, Storage};
use super::manager::MemoryManager;
use crate::error::{MemError, MemResult};
use crate::heap::{Coherency, HeapBackend, HeapKind, PhysicalLocation};
use crate::platform::PlatformConfig;
use parking_lot::Mutex;
use std::sync::Arc;

// ===============================================================================================
// Heap Selection
// ===============================================================================================

/// Ordered-fallback placement of new storage across the platform's heaps.
#[derive(Debug)]
pub struct HeapSelector {
    heaps: Vec<Arc<dyn HeapBackend>>,
    min_alignment: u32,
    small_alloc_threshold: u32,
}

/// Where a selection landed.
#[derive(Debug)]
pub struct Placement {
    pub heap: Arc<dyn HeapBackend>,
    pub location: PhysicalLocation,
    pub alignment: u32,
}

impl HeapSelector {
    #[must_use]
    pub fn new(heaps: Vec<Arc<dyn HeapBackend>>, config: &PlatformConfig) -> Self {
        Self {
            heaps,
            min_alignment: config.min_alignment,
            small_alloc_threshold: config.small_alloc_threshold,
        }
    }

    /// The backend for `kind`, if the platform has one and it is usable.
    #[must_use]
    pub fn heap(&self, kind: HeapKind) -> Option<&Arc<dyn HeapBackend>> {
        self.heaps
            .iter()
            .find(|h| h.kind() == kind && h.is_available())
    }

    pub fn heaps(&self) -> impl Iterator<Item = &Arc<dyn HeapBackend>> {
        self.heaps.iter()
    }

    /// Preference list used when the caller names no heaps.
    #[must_use]
    pub fn default_list(&self, size: u32, coherency: Coherency) -> Vec<HeapKind> {
        if size < self.small_alloc_threshold || coherency == Coherency::WriteCombined {
            return vec![HeapKind::System];
        }

        let mut list = vec![HeapKind::CarveOut, HeapKind::System];
        if self.heap(HeapKind::TranslatedIo).is_some() {
            list.push(HeapKind::TranslatedIo);
        }
        list
    }

    /// Tries each heap of `list` in order.
    ///
    /// `alignment` of zero means "platform default". Exhausted heaps fall through to the
    /// next entry; any other backend error ends the search.
    ///
    /// # Errors
    /// `BadValue` for a non-power-of-two alignment, `InsufficientMemory` if every usable
    /// heap is full, `NotSupported` if no heap of `list` exists on this platform.
    pub fn select(&self, size: u32, list: &[HeapKind], alignment: u32) -> MemResult<Placement> {
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(MemError::BadValue(format!(
                "alignment {alignment} is not a power of two"
            )));
        }
        let requested = alignment.max(self.min_alignment);
        let mut attempted = false;

        for &kind in list {
            let Some(heap) = self.heap(kind) else {
                log::debug!("select: {kind} heap not present, skipping");
                continue;
            };
            attempted = true;

            let align = requested.max(heap.descriptor().min_alignment);
            match heap.alloc(size as usize, align as usize) {
                Ok(location) => {
                    return Ok(Placement {
                        heap: Arc::clone(heap),
                        location,
                        alignment: align,
                    });
                }
                Err(MemError::InsufficientMemory) => {
                    log::debug!("select: {kind} heap cannot fit {size} bytes, falling back");
                }
                Err(e) => return Err(e),
            }
        }

        if attempted {
            Err(MemError::InsufficientMemory)
        } else {
            Err(MemError::NotSupported(format!(
                "none of {list:?} present on this platform"
            )))
        }
    }
}

// ===============================================================================================
// Allocate & Free
// ===============================================================================================

impl MemoryManager {
    /// Reserves storage for `handle`.
    ///
    /// `heaps` is the preference order (empty for the platform default), `alignment` zero
    /// for the platform default. The chosen heap may substitute its own `coherency`.
    ///
    /// # Errors
    /// See [`HeapSelector::select`]; also `AlreadyAllocated` on a second call and `BadValue`
    /// for a released handle. A failed call leaves the handle unallocated.
    pub fn allocate(
        &self,
        handle: MemHandle,
        heaps: &[HeapKind],
        alignment: u32,
        coherency: Coherency,
    ) -> MemResult<()> {
        let entry = self.lookup(handle)?;
        let _guard = self.alloc_lock.lock();

        let mut storage = entry.storage.write();
        if storage.is_some() {
            return Err(MemError::AlreadyAllocated);
        }

        let list = if heaps.is_empty() {
            self.selector.default_list(entry.size, coherency)
        } else {
            heaps.to_vec()
        };
        let placement = self.selector.select(entry.size, &list, alignment)?;

        let desc = *placement.heap.descriptor();
        let effective = desc.effective_coherency(coherency);
        if effective != coherency {
            log::debug!(
                "{handle}: {} heap cannot honor {coherency:?}, using {effective:?}",
                placement.heap.kind()
            );
        }
        log::debug!(
            "{handle}: {} bytes in {} heap (align {})",
            entry.size,
            placement.heap.kind(),
            placement.alignment
        );

        if self.config.eager_map && !effective.is_cached() && !desc.cpu_access.is_empty() {
            match placement.heap.map_cpu(&placement.location) {
                Ok(mapping) => *entry.mapping.lock() = Some(mapping),
                Err(e) => log::debug!("{handle}: eager mapping skipped: {e}"),
            }
        }

        *storage = Some(Storage {
            heap: placement.heap,
            location: placement.location,
            alignment: placement.alignment,
            coherency: effective,
            device: Mutex::new(None),
        });
        Ok(())
    }

    /// Drops the cached mapping, tears down device mappings, and returns the storage to its heap.
    pub(crate) fn free_storage(&self, entry: &HandleEntry) {
        drop(entry.mapping.lock().take());

        let Some(storage) = entry.storage.write().take() else {
            return;
        };
        if let Some(addr) = storage.device.lock().take() {
            storage.heap.unmap_pages(&storage.location, addr);
        }
        storage.heap.free(&storage.location);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::contiguous::ContiguousHeap;
    use crate::heap::HeapDescriptor;

    fn heap(kind: HeapKind, size: u64) -> Arc<dyn HeapBackend> {
        let desc = HeapDescriptor::for_kind(kind, 4096, 64);
        Arc::new(ContiguousHeap::new(kind, desc, size, 0x1000_0000).unwrap())
    }

    fn selector(heaps: Vec<Arc<dyn HeapBackend>>) -> HeapSelector {
        HeapSelector::new(heaps, &PlatformConfig::default())
    }

    #[test]
    fn default_list_prefers_system_for_small_or_write_combined() {
        let sel = selector(vec![heap(HeapKind::System, 0x10000)]);
        assert_eq!(
            sel.default_list(64, Coherency::WriteBack),
            [HeapKind::System]
        );
        assert_eq!(
            sel.default_list(1 << 20, Coherency::WriteCombined),
            [HeapKind::System]
        );
        assert_eq!(
            sel.default_list(1 << 20, Coherency::Uncached),
            [HeapKind::CarveOut, HeapKind::System]
        );
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let sel = selector(vec![heap(HeapKind::System, 0x10000)]);
        assert!(matches!(
            sel.select(64, &[HeapKind::System], 48),
            Err(MemError::BadValue(_))
        ));
    }

    #[test]
    fn alignment_is_raised_to_heap_minimum() {
        let sel = selector(vec![heap(HeapKind::System, 0x10000)]);
        let placement = sel.select(64, &[HeapKind::System], 16).unwrap();
        assert_eq!(placement.alignment, 4096);
    }

    #[test]
    fn falls_through_full_heaps() {
        let sel = selector(vec![
            heap(HeapKind::CarveOut, 0x1000),
            heap(HeapKind::System, 0x10000),
        ]);
        let placement = sel
            .select(0x2000, &[HeapKind::CarveOut, HeapKind::System], 0)
            .unwrap();
        assert_eq!(placement.heap.kind(), HeapKind::System);

        assert!(matches!(
            sel.select(0x20000, &[HeapKind::CarveOut, HeapKind::System], 0),
            Err(MemError::InsufficientMemory)
        ));
    }

    #[test]
    fn missing_heaps_are_not_supported() {
        let sel = selector(vec![heap(HeapKind::System, 0x10000)]);
        assert!(matches!(
            sel.select(64, &[HeapKind::VideoProtected], 0),
            Err(MemError::NotSupported(_))
        ));
    }
}
