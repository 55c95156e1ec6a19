use super::{
    CpuMapping, DeviceAddress, HeapBackend, HeapDescriptor, HeapKind, HeapUsage,
    INVALID_ADDRESS, PhysicalLocation,
};
use crate::error::{MemError, MemResult};
use crate::platform::service::{MemService, ServiceRequest, ServiceStatus};
use std::io;
use std::sync::Arc;

/// The secured heap: every operation is a request to the privileged memory service.
#[derive(Debug)]
pub struct ServiceHeap {
    descriptor: HeapDescriptor,
    service: Arc<dyn MemService>,
}

impl ServiceHeap {
    #[must_use]
    pub fn new(descriptor: HeapDescriptor, service: Arc<dyn MemService>) -> Self {
        Self {
            descriptor,
            service,
        }
    }

    fn id_of(location: &PhysicalLocation) -> MemResult<u64> {
        match location {
            PhysicalLocation::Service { id, .. } => Ok(*id),
            _ => Err(MemError::BadValue(
                "location does not belong to the secured heap".to_string(),
            )),
        }
    }
}

fn status_to_io(status: ServiceStatus) -> io::Error {
    let kind = match status {
        ServiceStatus::AccessDenied => io::ErrorKind::PermissionDenied,
        ServiceStatus::NoMemory => io::ErrorKind::OutOfMemory,
        _ => io::ErrorKind::InvalidInput,
    };
    io::Error::new(kind, status)
}

impl HeapBackend for ServiceHeap {
    fn kind(&self) -> HeapKind {
        HeapKind::Secured
    }

    fn descriptor(&self) -> &HeapDescriptor {
        &self.descriptor
    }

    fn alloc(&self, size: usize, align: usize) -> MemResult<PhysicalLocation> {
        let size32 = u32::try_from(size)
            .map_err(|_| MemError::BadValue(format!("size {size} exceeds service limit")))?;
        let align32 = u32::try_from(align)
            .map_err(|_| MemError::BadValue(format!("alignment {align} exceeds service limit")))?;

        let id = self.service.call(ServiceRequest::Create { size: size32 })?;

        let alloc = ServiceRequest::Alloc {
            id,
            align: align32,
            coherency: self.descriptor.fallback_coherency,
        };
        if let Err(status) = self.service.call(alloc) {
            if let Err(e) = self.service.call(ServiceRequest::Free { id }) {
                log::error!("secured: dropping id {id} after failed alloc: {e}");
            }
            return Err(status.into());
        }

        Ok(PhysicalLocation::Service { id, len: size })
    }

    fn free(&self, location: &PhysicalLocation) {
        match Self::id_of(location) {
            Ok(id) => {
                if let Err(e) = self.service.call(ServiceRequest::Free { id }) {
                    log::error!("secured: free of id {id} failed: {e}");
                }
            }
            Err(e) => log::error!("secured: {e}"),
        }
    }

    fn resolve_address(&self, location: &PhysicalLocation, offset: usize) -> DeviceAddress {
        let Ok(id) = Self::id_of(location) else {
            return INVALID_ADDRESS;
        };
        self.service
            .call(ServiceRequest::Address { id })
            .map_or(INVALID_ADDRESS, |base| base + offset as u64)
    }

    fn map_pages(&self, location: &PhysicalLocation) -> MemResult<DeviceAddress> {
        let id = Self::id_of(location)?;
        Ok(self.service.call(ServiceRequest::Pin { id })?)
    }

    fn unmap_pages(&self, location: &PhysicalLocation, _addr: DeviceAddress) {
        if let Ok(id) = Self::id_of(location)
            && let Err(e) = self.service.call(ServiceRequest::Unpin { id })
        {
            log::error!("secured: unpin of id {id} failed: {e}");
        }
    }

    fn map_cpu(&self, location: &PhysicalLocation) -> MemResult<CpuMapping> {
        let id = Self::id_of(location)?;
        Ok(self.service.map(id)?)
    }

    fn read(&self, location: &PhysicalLocation, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let id = Self::id_of(location).map_err(io::Error::other)?;
        self.service
            .read(id, offset as u64, buf)
            .map_err(status_to_io)
    }

    fn write(&self, location: &PhysicalLocation, offset: usize, data: &[u8]) -> io::Result<()> {
        let id = Self::id_of(location).map_err(io::Error::other)?;
        self.service
            .write(id, offset as u64, data)
            .map_err(status_to_io)
    }

    fn usage(&self) -> HeapUsage {
        self.service.usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::service::LocalMemService;

    fn heap(size: u64) -> ServiceHeap {
        let desc = HeapDescriptor::for_kind(HeapKind::Secured, 4096, 64);
        let service = LocalMemService::new(size, 0xC000_0000, 4096, false).unwrap();
        ServiceHeap::new(desc, Arc::new(service))
    }

    #[test]
    fn pin_goes_through_the_service() {
        let heap = heap(0x10000);
        let loc = heap.alloc(8192, 4096).unwrap();
        let addr = heap.map_pages(&loc).unwrap();
        assert_eq!(addr, heap.resolve_address(&loc, 0));
        assert_eq!(heap.resolve_address(&loc, 16), addr + 16);
        heap.unmap_pages(&loc, addr);
        heap.free(&loc);
        assert_eq!(heap.usage().used, 0);
    }

    #[test]
    fn failed_alloc_releases_the_created_id() {
        let heap = heap(0x2000);
        assert!(matches!(
            heap.alloc(0x4000, 4096),
            Err(MemError::InsufficientMemory)
        ));
        // The service still has room for an allocation that fits.
        assert!(heap.alloc(0x2000, 4096).is_ok());
    }

    #[test]
    fn cpu_mapping_is_denied_but_data_access_works() {
        let heap = heap(0x10000);
        let loc = heap.alloc(4096, 4096).unwrap();
        assert!(matches!(heap.map_cpu(&loc), Err(MemError::AccessDenied)));

        heap.write(&loc, 100, b"secret").unwrap();
        let mut buf = [0u8; 6];
        heap.read(&loc, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"secret");
    }
}
