use super::handle::MemHandle;
use super::manager::MemoryManager;
use crate::invariant_violation;
use std::ptr;

// Bounce buffer size for handle-to-handle copies
const COPY_CHUNK: usize = 4096;

/// Byte-granular access that works with or without a CPU mapping and without a pin.
///
/// Accessors go through the canonical mapping when one exists and fall back to the
/// heap's own read/write path otherwise. Out-of-range access panics.
impl MemoryManager {
    #[must_use]
    pub fn read8(&self, handle: MemHandle, offset: u32) -> u8 {
        let mut buf = [0u8; 1];
        self.read_block(handle, offset, &mut buf);
        buf[0]
    }

    #[must_use]
    pub fn read16(&self, handle: MemHandle, offset: u32) -> u16 {
        let mut buf = [0u8; 2];
        self.read_block(handle, offset, &mut buf);
        u16::from_ne_bytes(buf)
    }

    #[must_use]
    pub fn read32(&self, handle: MemHandle, offset: u32) -> u32 {
        let mut buf = [0u8; 4];
        self.read_block(handle, offset, &mut buf);
        u32::from_ne_bytes(buf)
    }

    pub fn write8(&self, handle: MemHandle, offset: u32, val: u8) {
        self.write_block(handle, offset, &[val]);
    }

    pub fn write16(&self, handle: MemHandle, offset: u32, val: u16) {
        self.write_block(handle, offset, &val.to_ne_bytes());
    }

    pub fn write32(&self, handle: MemHandle, offset: u32, val: u32) {
        self.write_block(handle, offset, &val.to_ne_bytes());
    }

    pub fn read_block(&self, handle: MemHandle, offset: u32, buf: &mut [u8]) {
        self.raw_read(handle, offset as usize, buf);
    }

    pub fn write_block(&self, handle: MemHandle, offset: u32, data: &[u8]) {
        self.raw_write(handle, offset as usize, data);
    }

    /// Gathers `out.len() / elem_size` elements spaced `stride` bytes apart into `out`.
    pub fn read_strided(
        &self,
        handle: MemHandle,
        offset: u32,
        elem_size: usize,
        stride: usize,
        out: &mut [u8],
    ) {
        assert!(
            elem_size > 0 && out.len() % elem_size == 0,
            "strided read: {} bytes is not a whole number of {elem_size}-byte elements",
            out.len()
        );
        for (idx, elem) in out.chunks_exact_mut(elem_size).enumerate() {
            self.raw_read(handle, offset as usize + idx * stride, elem);
        }
    }

    /// Scatters `data`, in `elem_size` pieces, to slots spaced `stride` bytes apart.
    pub fn write_strided(
        &self,
        handle: MemHandle,
        offset: u32,
        elem_size: usize,
        stride: usize,
        data: &[u8],
    ) {
        assert!(
            elem_size > 0 && data.len() % elem_size == 0,
            "strided write: {} bytes is not a whole number of {elem_size}-byte elements",
            data.len()
        );
        for (idx, elem) in data.chunks_exact(elem_size).enumerate() {
            self.raw_write(handle, offset as usize + idx * stride, elem);
        }
    }

    /// Copies `len` bytes between two handles, or within one.
    ///
    /// Overlapping ranges of the same handle behave like `memmove`.
    pub fn copy(&self, dst: MemHandle, dst_off: u32, src: MemHandle, src_off: u32, len: u32) {
        let (dst_off, src_off, len) = (dst_off as usize, src_off as usize, len as usize);
        self.check_bounds(src, src_off, len, "copy source");
        self.check_bounds(dst, dst_off, len, "copy destination");

        let mut bounce = vec![0u8; COPY_CHUNK.min(len)];
        let backwards = dst == src && dst_off > src_off && dst_off < src_off + len;

        let mut done = 0;
        while done < len {
            let n = COPY_CHUNK.min(len - done);
            let pos = if backwards { len - done - n } else { done };

            self.raw_read(src, src_off + pos, &mut bounce[..n]);
            self.raw_write(dst, dst_off + pos, &bounce[..n]);
            done += n;
        }
    }

    // ===========================================================================================
    // Primitives
    // ===========================================================================================

    fn check_bounds(&self, handle: MemHandle, offset: usize, len: usize, what: &str) {
        let size = self.get_size(handle) as usize;
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= size),
            "{what} {offset}+{len} out of bounds of {handle} ({size} bytes)"
        );
    }

    fn raw_read(&self, handle: MemHandle, offset: usize, buf: &mut [u8]) {
        let Some(entry) = self.expect_entry(handle, "read") else {
            return;
        };
        assert!(
            offset
                .checked_add(buf.len())
                .is_some_and(|end| end <= entry.size as usize),
            "read {offset}+{} out of bounds of {handle} ({} bytes)",
            buf.len(),
            entry.size
        );

        let storage = entry.storage.read();
        let Some(storage) = storage.as_ref() else {
            invariant_violation!("{handle}: read before allocation");
            return;
        };

        if let Some(mapping) = entry.mapping.lock().as_ref() {
            // SAFETY: bounds checked above; the mapping covers the whole handle.
            unsafe {
                ptr::copy_nonoverlapping(
                    mapping.as_ptr().as_ptr().add(offset),
                    buf.as_mut_ptr(),
                    buf.len(),
                );
            }
            return;
        }

        if let Err(e) = storage.heap.read(&storage.location, offset, buf) {
            log::error!("{handle}: backend read at {offset} failed: {e}");
        }
    }

    fn raw_write(&self, handle: MemHandle, offset: usize, data: &[u8]) {
        let Some(entry) = self.expect_entry(handle, "write") else {
            return;
        };
        assert!(
            offset
                .checked_add(data.len())
                .is_some_and(|end| end <= entry.size as usize),
            "write {offset}+{} out of bounds of {handle} ({} bytes)",
            data.len(),
            entry.size
        );

        let storage = entry.storage.read();
        let Some(storage) = storage.as_ref() else {
            invariant_violation!("{handle}: write before allocation");
            return;
        };

        if let Some(mapping) = entry.mapping.lock().as_ref() {
            // SAFETY: bounds checked above; the mapping covers the whole handle.
            unsafe {
                ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    mapping.as_ptr().as_ptr().add(offset),
                    data.len(),
                );
            }
            return;
        }

        if let Err(e) = storage.heap.write(&storage.location, offset, data) {
            log::error!("{handle}: backend write at {offset} failed: {e}");
        }
    }
}
