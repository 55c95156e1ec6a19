use super::handle::MemHandle;
use super::manager::MemoryManager;
use crate::error::{MemError, MemResult};
use crate::heap::AccessFlags;
use std::ptr::NonNull;

impl MemoryManager {
    /// CPU address of `[offset, offset + len)` within `handle`.
    ///
    /// Served from the handle's canonical whole-buffer mapping, which is created on
    /// first use and kept until [`unmap`](Self::unmap) is called for the whole buffer.
    ///
    /// # Errors
    /// `BadValue` for an out-of-range window or unallocated handle, `AccessDenied` if the
    /// heap does not permit `access`, or the heap's mapping error. State is unchanged on error.
    pub fn map(
        &self,
        handle: MemHandle,
        offset: u32,
        len: u32,
        access: AccessFlags,
    ) -> MemResult<NonNull<u8>> {
        let entry = self.lookup(handle)?;
        if offset.checked_add(len).is_none_or(|end| end > entry.size) {
            return Err(MemError::BadValue(format!(
                "map window {offset}+{len} exceeds {} bytes",
                entry.size
            )));
        }

        let storage = entry.storage.read();
        let storage = storage
            .as_ref()
            .ok_or_else(|| MemError::BadValue("map of unallocated handle".to_string()))?;
        if !storage.heap.descriptor().cpu_access.contains(access) {
            return Err(MemError::AccessDenied);
        }

        let mut slot = entry.mapping.lock();
        let mapping = match slot.take() {
            Some(mapping) => mapping,
            None => {
                let mapping = storage.heap.map_cpu(&storage.location)?;
                log::trace!("{handle}: mapped at {:p}", mapping.as_ptr());
                mapping
            }
        };
        let base = mapping.as_ptr();
        *slot = Some(mapping);

        // SAFETY: offset <= size == mapping length.
        Ok(unsafe { base.add(offset as usize) })
    }

    /// Tears down the canonical mapping if `addr`/`len` describe exactly that mapping.
    ///
    /// Any other range is left alone; partial views are the caller's own bookkeeping.
    pub fn unmap(&self, handle: MemHandle, addr: NonNull<u8>, len: u32) {
        let Some(entry) = self.expect_entry(handle, "unmap") else {
            return;
        };

        let mut slot = entry.mapping.lock();
        match slot.as_ref() {
            Some(mapping) if mapping.as_ptr() == addr && len == entry.size => {
                drop(slot.take());
                log::trace!("{handle}: unmapped {addr:p}");
            }
            Some(mapping) if mapping.contains(addr.as_ptr(), len as usize) => {
                log::debug!("{handle}: partial unmap of {addr:p}+{len} ignored");
            }
            _ => log::warn!("{handle}: unmap of unknown range {addr:p}+{len} ignored"),
        }
    }

    /// Whether `handle` currently holds its canonical CPU mapping.
    #[must_use]
    pub fn is_mapped(&self, handle: MemHandle) -> bool {
        self.expect_entry(handle, "is_mapped")
            .is_some_and(|e| e.mapping.lock().is_some())
    }
}
