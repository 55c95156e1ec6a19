use super::arena::PhysArena;
use super::region::{RangeAllocator, Region};
use super::{
    CpuMapping, DeviceAddress, HeapBackend, HeapDescriptor, HeapKind, HeapUsage,
    INVALID_ADDRESS, PhysicalLocation,
};
use crate::error::{MemError, MemResult};
use parking_lot::Mutex;
use std::io;

/// A heap handing out ranges of one contiguous region.
///
/// Backs the carveouts, on-chip RAM and the protected regions, and on the
/// simulated platform also system RAM (with page granularity).
#[derive(Debug)]
pub struct ContiguousHeap {
    kind: HeapKind,
    descriptor: HeapDescriptor,
    arena: PhysArena,
    region: Mutex<Region>,
}

impl ContiguousHeap {
    /// # Errors
    /// Returns an error if the backing storage cannot be created.
    pub fn new(
        kind: HeapKind,
        descriptor: HeapDescriptor,
        size: u64,
        phys_base: u64,
    ) -> io::Result<Self> {
        let arena = PhysArena::new(kind.name(), size, phys_base)?;

        // Ranges are carved in bus-address space so alignment holds for devices.
        let region = Region::new(
            phys_base,
            phys_base + size,
            u64::from(descriptor.min_alignment),
            0,
        );

        Ok(Self {
            kind,
            descriptor,
            arena,
            region: Mutex::new(region),
        })
    }

    fn arena_offset(location: &PhysicalLocation, offset: usize) -> io::Result<u64> {
        match location {
            PhysicalLocation::Contiguous { offset: base, .. } => Ok(base + offset as u64),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "location does not belong to a contiguous heap",
            )),
        }
    }
}

impl HeapBackend for ContiguousHeap {
    fn kind(&self) -> HeapKind {
        self.kind
    }

    fn descriptor(&self) -> &HeapDescriptor {
        &self.descriptor
    }

    fn alloc(&self, size: usize, align: usize) -> MemResult<PhysicalLocation> {
        let phys = self
            .region
            .lock()
            .allocate(size as u64, align as u64)
            .ok_or(MemError::InsufficientMemory)?;

        Ok(PhysicalLocation::Contiguous {
            phys,
            offset: phys - self.arena.phys_base(),
            len: size,
        })
    }

    fn free(&self, location: &PhysicalLocation) {
        if let PhysicalLocation::Contiguous { phys, .. } = location {
            self.region.lock().free(*phys);
        } else {
            log::error!("{}: free of foreign location {location:?}", self.kind);
        }
    }

    fn resolve_address(&self, location: &PhysicalLocation, offset: usize) -> DeviceAddress {
        match location {
            PhysicalLocation::Contiguous { phys, .. } => phys + offset as u64,
            _ => INVALID_ADDRESS,
        }
    }

    fn map_cpu(&self, location: &PhysicalLocation) -> MemResult<CpuMapping> {
        if self.descriptor.cpu_access.is_empty() {
            return Err(MemError::AccessDenied);
        }
        let offset = Self::arena_offset(location, 0)?;
        self.arena
            .map(offset, location.len(), self.descriptor.cpu_access.to_prot())
            .map_err(|e| MemError::MappingFailed(format!("{}: {e}", self.kind)))
    }

    fn read(&self, location: &PhysicalLocation, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.arena.read_at(Self::arena_offset(location, offset)?, buf)
    }

    fn write(&self, location: &PhysicalLocation, offset: usize, data: &[u8]) -> io::Result<()> {
        self.arena.write_at(Self::arena_offset(location, offset)?, data)
    }

    fn usage(&self) -> HeapUsage {
        self.region.lock().usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn carveout(size: u64) -> ContiguousHeap {
        let desc = HeapDescriptor::for_kind(HeapKind::CarveOut, 4096, 64);
        ContiguousHeap::new(HeapKind::CarveOut, desc, size, 0x4000_0000).unwrap()
    }

    #[test]
    fn addresses_are_offsets_from_phys_base() {
        let heap = carveout(0x10000);
        let a = heap.alloc(100, 256).unwrap();
        let b = heap.alloc(100, 256).unwrap();
        assert_eq!(heap.resolve_address(&a, 0), 0x4000_0000);
        assert_eq!(heap.resolve_address(&b, 4), 0x4000_0104);
        assert_eq!(heap.usage().used, 256);
    }

    #[test]
    fn exhaustion_is_insufficient_memory() {
        let heap = carveout(0x1000);
        heap.alloc(0x1000, 64).unwrap();
        assert!(matches!(
            heap.alloc(64, 64),
            Err(MemError::InsufficientMemory)
        ));
    }

    #[test]
    fn free_returns_space() {
        let heap = carveout(0x1000);
        let loc = heap.alloc(0x1000, 64).unwrap();
        heap.free(&loc);
        assert_eq!(heap.usage().used, 0);
        assert!(heap.alloc(0x1000, 64).is_ok());
    }

    #[test]
    fn alignment_holds_for_bus_addresses_on_unaligned_base() {
        let desc = HeapDescriptor::for_kind(HeapKind::CarveOut, 4096, 64);
        let heap = ContiguousHeap::new(HeapKind::CarveOut, desc, 0x10000, 0x4000_0100).unwrap();

        let loc = heap.alloc(64, 4096).unwrap();
        let addr = heap.resolve_address(&loc, 0);
        assert_eq!(addr % 4096, 0);
        assert_eq!(addr, 0x4000_1000);

        // Storage and mapping still agree on the same bytes.
        heap.write(&loc, 0, b"dma").unwrap();
        let mapping = heap.map_cpu(&loc).unwrap();
        let seen = unsafe { std::slice::from_raw_parts(mapping.as_ptr().as_ptr(), 3) };
        assert_eq!(seen, b"dma");

        heap.free(&loc);
        assert_eq!(heap.usage().used, 0);
    }

    #[test]
    fn protected_heap_refuses_cpu_mapping() {
        let desc = HeapDescriptor::for_kind(HeapKind::VideoProtected, 4096, 64);
        let heap =
            ContiguousHeap::new(HeapKind::VideoProtected, desc, 0x10000, 0x9000_0000).unwrap();
        let loc = heap.alloc(4096, 4096).unwrap();
        assert!(matches!(heap.map_cpu(&loc), Err(MemError::AccessDenied)));
    }
}
