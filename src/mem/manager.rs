use super::handle::{HandleEntry, HandleInfo, HandleTable, MemHandle};
use super::selector::HeapSelector;
use crate::error::{MemError, MemResult};
use crate::heap::{Coherency, HeapBackend, HeapKind, HeapUsage};
use crate::invariant_violation;
use crate::platform::{self, PlatformConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Process-wide buffer manager: owns the heaps, the handle table and the allocation lock.
///
/// Construct one per process (or per test) and pass it to every driver that shares
/// buffers. Dropping it reclaims any handles still alive.
#[derive(Debug)]
pub struct MemoryManager {
    pub(crate) config: PlatformConfig,
    pub(crate) selector: HeapSelector,
    pub(crate) table: HandleTable,

    // Serializes allocate/free against the (non-reentrant) heap backends
    pub(crate) alloc_lock: Mutex<()>,
}

impl MemoryManager {
    /// Brings up every heap `config` describes.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or a heap cannot be set up.
    pub fn open(config: PlatformConfig) -> MemResult<Self> {
        let heaps = platform::open_heaps(&config)?;
        Self::with_heaps(config, heaps)
    }

    /// # Errors
    /// Returns an error if the simulated heaps cannot be set up.
    pub fn simulated() -> MemResult<Self> {
        Self::open(PlatformConfig::simulated())
    }

    /// Uses caller-provided backends instead of the ones `config` describes.
    ///
    /// # Errors
    /// `BadValue` if `config` fails [`PlatformConfig::validate`].
    pub fn with_heaps(config: PlatformConfig, heaps: Vec<Arc<dyn HeapBackend>>) -> MemResult<Self> {
        config.validate()?;
        let selector = HeapSelector::new(heaps, &config);
        Ok(Self {
            config,
            selector,
            table: HandleTable::default(),
            alloc_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Whether a usable heap of `kind` exists.
    #[must_use]
    pub fn has_heap(&self, kind: HeapKind) -> bool {
        self.selector.heap(kind).is_some()
    }

    #[must_use]
    pub fn heap_usage(&self, kind: HeapKind) -> Option<HeapUsage> {
        self.selector.heap(kind).map(|h| h.usage())
    }

    #[must_use]
    pub const fn cache_line_size(&self) -> u32 {
        self.config.cache_line_size
    }

    // ===========================================================================================
    // Handle Lifecycle
    // ===========================================================================================

    /// Creates an unallocated handle of `size` bytes with one reference.
    ///
    /// # Errors
    /// `BadValue` if `size` is zero.
    pub fn create(&self, size: u32) -> MemResult<MemHandle> {
        if size == 0 {
            return Err(MemError::BadValue("zero-sized handle".to_string()));
        }
        let handle = self.table.insert(size);
        log::trace!("{handle}: created, {size} bytes");
        Ok(handle)
    }

    pub fn add_ref(&self, handle: MemHandle) {
        let Some(entry) = self.expect_entry(handle, "add_ref") else {
            return;
        };
        if !entry.try_acquire() {
            invariant_violation!("{handle}: add_ref after final release");
        }
    }

    /// Drops one reference; the last one frees the storage and the handle.
    ///
    /// Outstanding pins at the last release are a contract violation. A cached CPU
    /// mapping is not: allocation may have created it eagerly, so it is torn down here
    /// along with the storage. Releasing [`MemHandle::NULL`] is a no-op.
    pub fn release(&self, handle: MemHandle) {
        if handle.is_null() {
            return;
        }
        let Some(entry) = self.expect_entry(handle, "release") else {
            return;
        };

        let prev = entry.refs.fetch_sub(1, Ordering::AcqRel);
        if prev > 1 {
            return;
        }
        if prev < 1 {
            entry.refs.fetch_add(1, Ordering::AcqRel);
            invariant_violation!("{handle}: reference count underflow");
            return;
        }

        let _guard = self.alloc_lock.lock();
        let pins = entry.pins.load(Ordering::Acquire);
        if pins != 0 {
            invariant_violation!("{handle}: freed with {pins} outstanding pins");
        }
        self.destroy(handle, &entry);
        log::trace!("{handle}: freed");
    }

    /// Reference to `handle` suitable for passing to another subsystem or process.
    #[must_use]
    pub fn get_shared_id(&self, handle: MemHandle) -> u64 {
        if self.expect_entry(handle, "get_shared_id").is_none() {
            return 0;
        }
        handle.to_raw()
    }

    /// Resolves a shared id and takes a reference on the handle behind it.
    ///
    /// # Errors
    /// `BadValue` if the id names no live handle.
    pub fn from_shared_id(&self, id: u64) -> MemResult<MemHandle> {
        let handle = MemHandle::from_raw(id);
        let entry = self.lookup(handle)?;
        if !entry.try_acquire() {
            return Err(MemError::BadValue(format!("shared id 0x{id:x} already released")));
        }
        Ok(handle)
    }

    // ===========================================================================================
    // Queries
    // ===========================================================================================

    #[must_use]
    pub fn get_size(&self, handle: MemHandle) -> u32 {
        self.expect_entry(handle, "get_size").map_or(0, |e| e.size)
    }

    /// Alignment committed at allocation; zero while unallocated.
    #[must_use]
    pub fn get_alignment(&self, handle: MemHandle) -> u32 {
        self.expect_entry(handle, "get_alignment")
            .and_then(|e| e.storage.read().as_ref().map(|s| s.alignment))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn get_heap_kind(&self, handle: MemHandle) -> Option<HeapKind> {
        self.expect_entry(handle, "get_heap_kind")
            .and_then(|e| e.storage.read().as_ref().map(|s| s.heap.kind()))
    }

    /// The coherency actually in force, after any downgrade by the heap.
    #[must_use]
    pub fn get_coherency(&self, handle: MemHandle) -> Option<Coherency> {
        self.expect_entry(handle, "get_coherency")
            .and_then(|e| e.storage.read().as_ref().map(|s| s.coherency))
    }

    #[must_use]
    pub fn handle_info(&self, handle: MemHandle) -> Option<HandleInfo> {
        self.live_entry(handle).map(|e| e.info())
    }

    #[must_use]
    pub fn is_valid(&self, handle: MemHandle) -> bool {
        self.live_entry(handle).is_some()
    }

    #[must_use]
    pub fn live_handles(&self) -> Vec<MemHandle> {
        self.table.handles()
    }

    // ===========================================================================================
    // Internals
    // ===========================================================================================

    fn live_entry(&self, handle: MemHandle) -> Option<Arc<HandleEntry>> {
        self.table.get(handle).filter(|e| e.is_live())
    }

    /// Entry for an operation that reports failures as errors.
    pub(crate) fn lookup(&self, handle: MemHandle) -> MemResult<Arc<HandleEntry>> {
        self.live_entry(handle)
            .ok_or_else(|| MemError::BadValue(format!("{handle} is not a live handle")))
    }

    /// Entry for an operation whose caller contract requires a live handle.
    pub(crate) fn expect_entry(&self, handle: MemHandle, op: &str) -> Option<Arc<HandleEntry>> {
        let entry = self.live_entry(handle);
        if entry.is_none() {
            invariant_violation!("{op} on stale handle {handle}");
        }
        entry
    }

    // Caller holds the allocation lock.
    fn destroy(&self, handle: MemHandle, entry: &HandleEntry) {
        entry.retire();
        self.free_storage(entry);
        self.table.remove(handle);
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        let _guard = self.alloc_lock.lock();

        for handle in self.table.handles() {
            let Some(entry) = self.table.get(handle) else {
                continue;
            };
            log::warn!(
                "{handle}: leaked ({} bytes, {} refs, {} pins), reclaiming",
                entry.size,
                entry.refs.load(Ordering::Acquire),
                entry.pins.load(Ordering::Acquire)
            );
            self.destroy(handle, &entry);
        }
    }
}
