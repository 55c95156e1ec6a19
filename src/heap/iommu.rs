#![allow(clippy::cast_possible_truncation)]

use super::arena::PhysArena;
use super::region::{RangeAllocator, Region};
use super::{
    CpuMapping, DeviceAddress, HeapBackend, HeapDescriptor, HeapKind, HeapUsage,
    INVALID_ADDRESS, PhysicalLocation,
};
use crate::error::{MemError, MemResult};
use crate::utils::page_count;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::ptr::{self, NonNull};
use std::sync::Arc;

const IOVA_GUARD_PAGES: u64 = 1;

/// Pages scattered through a page pool, stitched together for devices by an
/// IOMMU page table and for the CPU by a multi-page mapping.
#[derive(Debug)]
pub struct TranslatedIoHeap {
    descriptor: HeapDescriptor,
    page_size: u64,
    pool: PhysArena,
    frames: Mutex<Region>,
    iova: Mutex<Region>,

    // Programmed translations: IOVA -> backing pages
    page_table: Mutex<BTreeMap<u64, Arc<[u64]>>>,
}

impl TranslatedIoHeap {
    /// # Errors
    /// Returns an error if the page pool cannot be created.
    pub fn new(
        descriptor: HeapDescriptor,
        pool_size: u64,
        phys_base: u64,
        iova_base: u64,
        iova_size: u64,
    ) -> io::Result<Self> {
        let page_size = u64::from(descriptor.min_alignment);
        let pool = PhysArena::new(HeapKind::TranslatedIo.name(), pool_size, phys_base)?;

        Ok(Self {
            descriptor,
            page_size,
            pool,
            frames: Mutex::new(Region::new(0, pool_size, page_size, 0)),
            iova: Mutex::new(Region::new(
                iova_base,
                iova_base + iova_size,
                page_size,
                IOVA_GUARD_PAGES * page_size,
            )),
            page_table: Mutex::new(BTreeMap::new()),
        })
    }

    /// Walks the page table: the bus address currently backing `iova`.
    #[must_use]
    pub fn translate(&self, iova: DeviceAddress) -> Option<u64> {
        let table = self.page_table.lock();
        let (&start, pages) = table.range(..=iova).next_back()?;
        let idx = ((iova - start) / self.page_size) as usize;
        let page = pages.get(idx)?;
        Some(self.pool.phys_base() + page + (iova - start) % self.page_size)
    }

    fn pages_of(location: &PhysicalLocation) -> io::Result<&[u64]> {
        match location {
            PhysicalLocation::Pages { pages, .. } => Ok(&pages[..]),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "location does not belong to the IOMMU heap",
            )),
        }
    }

    /// Runs `op` once per page-bounded chunk of `[offset, offset + len)`.
    fn for_each_chunk<F>(&self, pages: &[u64], offset: usize, len: usize, mut op: F) -> io::Result<()>
    where
        F: FnMut(u64, std::ops::Range<usize>) -> io::Result<()>,
    {
        let page = self.page_size as usize;
        let mut done = 0;

        while done < len {
            let pos = offset + done;
            let in_page = pos % page;
            let chunk = (page - in_page).min(len - done);
            let frame = pages.get(pos / page).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "offset beyond allocation")
            })?;

            op(frame + in_page as u64, done..done + chunk)?;
            done += chunk;
        }
        Ok(())
    }
}

impl HeapBackend for TranslatedIoHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::TranslatedIo
    }

    fn descriptor(&self) -> &HeapDescriptor {
        &self.descriptor
    }

    fn alloc(&self, size: usize, align: usize) -> MemResult<PhysicalLocation> {
        let count = page_count(size, self.page_size as usize);
        let mut frames = self.frames.lock();
        let mut pages = Vec::with_capacity(count);

        for _ in 0..count {
            if let Some(frame) = frames.allocate(self.page_size, self.page_size) {
                pages.push(frame);
            } else {
                for frame in pages {
                    frames.free(frame);
                }
                return Err(MemError::InsufficientMemory);
            }
        }

        Ok(PhysicalLocation::Pages {
            pages: pages.into(),
            len: size,
            align: (align as u64).max(self.page_size),
        })
    }

    fn free(&self, location: &PhysicalLocation) {
        match Self::pages_of(location) {
            Ok(pages) => {
                let mut frames = self.frames.lock();
                for &frame in pages {
                    frames.free(frame);
                }
            }
            Err(e) => log::error!("iommu: {e}"),
        }
    }

    fn resolve_address(&self, location: &PhysicalLocation, offset: usize) -> DeviceAddress {
        let Ok(pages) = Self::pages_of(location) else {
            return INVALID_ADDRESS;
        };
        let page = self.page_size as usize;
        pages.get(offset / page).map_or(INVALID_ADDRESS, |frame| {
            self.pool.phys_base() + frame + (offset % page) as u64
        })
    }

    fn map_pages(&self, location: &PhysicalLocation) -> MemResult<DeviceAddress> {
        let PhysicalLocation::Pages { pages, align, .. } = location else {
            return Err(MemError::BadValue(
                "location does not belong to the IOMMU heap".to_string(),
            ));
        };

        let span = pages.len() as u64 * self.page_size;
        let iova = self
            .iova
            .lock()
            .allocate(span, *align)
            .ok_or_else(|| MemError::MappingFailed("IOMMU aperture exhausted".to_string()))?;

        self.page_table.lock().insert(iova, Arc::clone(pages));
        log::trace!("iommu: mapped {} pages at iova 0x{iova:x}", pages.len());
        Ok(iova)
    }

    fn unmap_pages(&self, _location: &PhysicalLocation, addr: DeviceAddress) {
        if self.page_table.lock().remove(&addr).is_none() {
            log::warn!("iommu: unmap of unknown iova 0x{addr:x}");
            return;
        }
        self.iova.lock().free(addr);
    }

    fn map_cpu(&self, location: &PhysicalLocation) -> MemResult<CpuMapping> {
        if self.descriptor.cpu_access.is_empty() {
            return Err(MemError::AccessDenied);
        }
        let pages = Self::pages_of(location)?;
        let prot = self.descriptor.cpu_access.to_prot();
        let page = self.page_size as usize;
        let span = pages.len() * page;

        // Reserve the whole span first, then overlay each backing page in place.
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                span,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(MemError::MappingFailed(
                io::Error::last_os_error().to_string(),
            ));
        }
        let base = NonNull::new(ret)
            .ok_or_else(|| MemError::MappingFailed("mmap returned null".to_string()))?;

        // SAFETY: the reservation is owned by the new value, which unmaps it (overlays included).
        let mapping = unsafe { CpuMapping::from_raw(base, span, 0, location.len()) };

        for (idx, &frame) in pages.iter().enumerate() {
            let at = unsafe { base.as_ptr().cast::<u8>().add(idx * page) };
            // SAFETY: `at` is a page-aligned address inside the reservation above.
            unsafe { self.pool.map_page_fixed(at.cast(), frame, prot) }
                .map_err(|e| MemError::MappingFailed(format!("iommu: {e}")))?;
        }

        Ok(mapping)
    }

    fn read(&self, location: &PhysicalLocation, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let pages = Self::pages_of(location)?;
        self.for_each_chunk(pages, offset, buf.len(), |at, range| {
            self.pool.read_at(at, &mut buf[range])
        })
    }

    fn write(&self, location: &PhysicalLocation, offset: usize, data: &[u8]) -> io::Result<()> {
        let pages = Self::pages_of(location)?;
        self.for_each_chunk(pages, offset, data.len(), |at, range| {
            self.pool.write_at(at, &data[range])
        })
    }

    fn usage(&self) -> HeapUsage {
        self.frames.lock().usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    fn heap() -> TranslatedIoHeap {
        let desc = HeapDescriptor::for_kind(HeapKind::TranslatedIo, PAGE as u32, 64);
        TranslatedIoHeap::new(desc, 16 * PAGE, 0x8000_0000, 0x1000_0000, 64 * PAGE).unwrap()
    }

    #[test]
    fn allocation_is_page_granular() {
        let heap = heap();
        let loc = heap.alloc(PAGE as usize + 1, 1).unwrap();
        let PhysicalLocation::Pages { pages, .. } = &loc else {
            panic!("expected page list");
        };
        assert_eq!(pages.len(), 2);
        assert_eq!(heap.usage().used, 2 * PAGE);
    }

    #[test]
    fn page_table_translates_iova_to_backing_pages() {
        let heap = heap();
        let hole = heap.alloc(PAGE as usize, 1).unwrap();
        let loc = heap.alloc(3 * PAGE as usize, 1).unwrap();
        heap.free(&hole);

        let iova = heap.map_pages(&loc).unwrap();
        for offset in [0, 10, PAGE as usize + 5, 2 * PAGE as usize + 7] {
            assert_eq!(
                heap.translate(iova + offset as u64),
                Some(heap.resolve_address(&loc, offset))
            );
        }

        heap.unmap_pages(&loc, iova);
        assert_eq!(heap.translate(iova), None);
    }

    #[test]
    fn pool_exhaustion_rolls_back_partial_allocation() {
        let heap = heap();
        heap.alloc(10 * PAGE as usize, 1).unwrap();
        assert!(matches!(
            heap.alloc(7 * PAGE as usize, 1),
            Err(MemError::InsufficientMemory)
        ));
        assert_eq!(heap.usage().used, 10 * PAGE);
    }

    #[test]
    fn scatter_io_crosses_page_boundaries() {
        let heap = heap();
        let loc = heap.alloc(2 * PAGE as usize, 1).unwrap();
        let data: Vec<u8> = (0..64).collect();
        heap.write(&loc, PAGE as usize - 32, &data).unwrap();

        let mut back = vec![0u8; 64];
        heap.read(&loc, PAGE as usize - 32, &mut back).unwrap();
        assert_eq!(back, data);

        let mapping = heap.map_cpu(&loc).unwrap();
        let view = unsafe {
            std::slice::from_raw_parts(mapping.as_ptr().as_ptr().add(PAGE as usize - 32), 64)
        };
        assert_eq!(view, &data[..]);
    }
}
