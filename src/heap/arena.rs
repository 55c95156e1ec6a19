#![allow(clippy::cast_possible_truncation)]

use super::CpuMapping;
use crate::utils::{align_down, page_size};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::FileExt;
use std::ptr::{self, NonNull};

/// Backing store standing in for a physical memory region.
///
/// The storage is an anonymous `memfd`, so the same bytes can be reached through
/// `pread`/`pwrite` (the unmapped access path) and through any number of shared
/// `mmap` views (CPU mappings).
#[derive(Debug)]
pub struct PhysArena {
    file: File,
    size: u64,
    phys_base: u64,
}

impl PhysArena {
    /// Creates a zero-filled arena of `size` bytes that devices see at `phys_base`.
    ///
    /// # Errors
    /// Returns an error if the memfd cannot be created or sized.
    pub fn new(name: &str, size: u64, phys_base: u64) -> io::Result<Self> {
        let cname = CString::new(name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let fd = unsafe { libc::memfd_create(cname.as_ptr(), libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: fd was just returned by memfd_create and is owned by nobody else.
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size)?;

        Ok(Self {
            file,
            size,
            phys_base,
        })
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn phys_base(&self) -> u64 {
        self.phys_base
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_range(offset, buf.len())?;
        self.file.read_exact_at(buf, offset)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.check_range(offset, data.len())?;
        self.file.write_all_at(data, offset)
    }

    /// Maps `len` bytes starting at `offset` with protection `prot`.
    ///
    /// `offset` need not be page aligned; the view starts at the enclosing page.
    ///
    /// # Errors
    /// Returns the OS error if `mmap` fails.
    pub fn map(&self, offset: u64, len: usize, prot: libc::c_int) -> io::Result<CpuMapping> {
        self.check_range(offset, len)?;

        let page = page_size() as u64;
        let map_offset = align_down(offset, page);
        let delta = (offset - map_offset) as usize;
        let map_len = delta + len;

        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                prot,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                map_offset as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(ret).ok_or_else(|| io::Error::other("mmap returned null"))?;

        // SAFETY: base..base + map_len was just mapped and is owned by the new value.
        Ok(unsafe { CpuMapping::from_raw(base, map_len, delta, len) })
    }

    /// Maps one page of the arena over an already reserved address.
    ///
    /// # Safety
    /// `at` must be page aligned and lie inside a reservation owned by the caller.
    pub unsafe fn map_page_fixed(
        &self,
        at: *mut libc::c_void,
        offset: u64,
        prot: libc::c_int,
    ) -> io::Result<()> {
        let page = page_size();
        self.check_range(offset, page)?;

        let ret = unsafe {
            libc::mmap(
                at,
                page,
                prot,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.file.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> io::Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "range 0x{offset:x}+0x{len:x} outside arena of 0x{:x} bytes",
                    self.size
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RW: libc::c_int = libc::PROT_READ | libc::PROT_WRITE;

    #[test]
    fn unmapped_and_mapped_views_agree() {
        let arena = PhysArena::new("arena-test", 0x4000, 0x8000_0000).unwrap();
        arena.write_at(0x1010, b"hello").unwrap();

        let mapping = arena.map(0x1010, 5, RW).unwrap();
        let seen = unsafe { std::slice::from_raw_parts(mapping.as_ptr().as_ptr(), 5) };
        assert_eq!(seen, b"hello");

        unsafe { mapping.as_ptr().as_ptr().write(b'j') };
        let mut buf = [0u8; 5];
        arena.read_at(0x1010, &mut buf).unwrap();
        assert_eq!(&buf, b"jello");
    }

    #[test]
    fn out_of_range_access_is_rejected() {
        let arena = PhysArena::new("arena-test", 0x1000, 0).unwrap();
        let mut buf = [0u8; 16];
        assert!(arena.read_at(0xff8, &mut buf).is_err());
        assert!(arena.write_at(u64::MAX, &buf).is_err());
        assert!(arena.map(0x800, 0x1000, RW).is_err());
    }
}
