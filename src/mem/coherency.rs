use super::handle::MemHandle;
use super::manager::MemoryManager;
use crate::utils::{align_down, align_up};

/// Cache maintenance operation over a CPU address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    /// Push dirty lines to memory so a device reads what the CPU wrote.
    WriteBack,
    /// Drop cached lines so the CPU reads what a device wrote.
    Invalidate,
    WriteBackInvalidate,
}

impl MemoryManager {
    /// Hands `[addr, addr + len)` from a device to the CPU.
    pub fn sync_for_cpu(&self, handle: MemHandle, addr: *const u8, len: usize) {
        self.cache_maint(handle, addr, len, CacheOp::Invalidate);
    }

    /// Hands `[addr, addr + len)` from the CPU to a device.
    pub fn sync_for_device(&self, handle: MemHandle, addr: *const u8, len: usize) {
        self.cache_maint(handle, addr, len, CacheOp::WriteBack);
    }

    /// Runs `op` over the part of the handle's canonical mapping covered by the range.
    ///
    /// Must bracket every CPU/device hand-off whatever the handle's coherency; on
    /// uncached and write-combined buffers, and for addresses outside the canonical
    /// mapping, this reduces to a full memory barrier.
    pub fn cache_maint(&self, handle: MemHandle, addr: *const u8, len: usize, op: CacheOp) {
        let Some(entry) = self.expect_entry(handle, "cache_maint") else {
            return;
        };

        let cached = entry
            .storage
            .read()
            .as_ref()
            .is_some_and(|s| s.coherency.is_cached());

        if cached && len > 0 {
            let mapping = entry.mapping.lock();
            if mapping.as_ref().is_some_and(|m| m.contains(addr, len)) {
                let line = self.config.cache_line_size as usize;
                let start = align_down(addr as u64, line as u64) as usize;
                let end = align_up(addr as u64 + len as u64, line as u64) as usize;

                // SAFETY: the widened range stays inside the pages backing the live mapping,
                // which the held lock keeps alive.
                unsafe { arch::maintain(start, end, line, op) };
                log::trace!("{handle}: {op:?} over 0x{start:x}..0x{end:x}");
            }
        }

        arch::barrier();
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::CacheOp;
    use std::arch::x86_64::_mm_clflush;
    use std::sync::atomic::{Ordering, fence};

    /// x86 has no user-mode invalidate-only line op; every operation flushes.
    pub unsafe fn maintain(start: usize, end: usize, line: usize, _op: CacheOp) {
        for addr in (start..end).step_by(line) {
            unsafe { _mm_clflush(addr as *const u8) };
        }
    }

    /// Orders the flushes above; compiles to `mfence`.
    pub fn barrier() {
        fence(Ordering::SeqCst);
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::CacheOp;
    use std::arch::asm;

    pub unsafe fn maintain(start: usize, end: usize, line: usize, op: CacheOp) {
        for addr in (start..end).step_by(line) {
            match op {
                CacheOp::WriteBack => unsafe {
                    asm!("dc cvac, {0}", in(reg) addr, options(nostack, preserves_flags));
                },
                // DC IVAC is not available at EL0.
                CacheOp::Invalidate | CacheOp::WriteBackInvalidate => unsafe {
                    asm!("dc civac, {0}", in(reg) addr, options(nostack, preserves_flags));
                },
            }
        }
    }

    pub fn barrier() {
        unsafe { asm!("dsb sy", options(nostack, preserves_flags)) };
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod arch {
    use super::CacheOp;
    use std::sync::atomic::{Ordering, fence};

    pub unsafe fn maintain(_start: usize, _end: usize, _line: usize, _op: CacheOp) {}

    pub fn barrier() {
        fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{Ordering, fence};

    #[test]
    fn maintenance_over_live_memory_is_harmless() {
        let buf = vec![0xA5u8; 4096];
        let start = buf.as_ptr() as usize;
        unsafe { arch::maintain(start, start + buf.len(), 64, CacheOp::WriteBackInvalidate) };
        arch::barrier();
        fence(Ordering::SeqCst);
        assert!(buf.iter().all(|&b| b == 0xA5));
    }
}
