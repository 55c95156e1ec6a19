use crate::error::MemError;
use crate::heap::arena::PhysArena;
use crate::heap::region::{RangeAllocator, Region};
use crate::heap::{AccessFlags, Coherency, CpuMapping, HeapUsage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// ===============================================================================================
// Wire Types
// ===============================================================================================

/// Failure codes of the privileged memory service (errno values).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ServiceStatus {
    #[error("service out of memory")]
    NoMemory = -12,
    #[error("request refused by policy")]
    AccessDenied = -13,
    #[error("service not present")]
    NoDevice = -19,
    #[error("malformed request")]
    BadRequest = -22,
}

impl From<ServiceStatus> for MemError {
    fn from(status: ServiceStatus) -> Self {
        match status {
            ServiceStatus::NoMemory => Self::InsufficientMemory,
            ServiceStatus::AccessDenied => Self::AccessDenied,
            ServiceStatus::NoDevice => Self::NotSupported("memory service".to_string()),
            ServiceStatus::BadRequest => Self::Service(status.to_string()),
        }
    }
}

/// One synchronous request to the service. Ids are issued by `Create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRequest {
    /// Create a handle of `size` bytes; returns its id.
    Create { size: u32 },
    /// Reserve storage for a created handle.
    Alloc {
        id: u64,
        align: u32,
        coherency: Coherency,
    },
    /// Lock the storage in place; returns its bus address.
    Pin { id: u64 },
    Unpin { id: u64 },
    /// Bus address of the storage, pinned or not.
    Address { id: u64 },
    Free { id: u64 },
}

/// Channel to a kernel-resident allocator.
///
/// Every call is synchronous and may block; the core never retries a failed request.
pub trait MemService: Send + Sync + fmt::Debug {
    /// Issue `request`; on success returns the request's value (id, address, or 0).
    fn call(&self, request: ServiceRequest) -> Result<u64, ServiceStatus>;

    fn read(&self, id: u64, offset: u64, buf: &mut [u8]) -> Result<(), ServiceStatus>;

    fn write(&self, id: u64, offset: u64, data: &[u8]) -> Result<(), ServiceStatus>;

    /// Map the whole handle for the calling process.
    fn map(&self, id: u64) -> Result<CpuMapping, ServiceStatus>;

    fn usage(&self) -> HeapUsage;
}

// ===============================================================================================
// In-Process Service
// ===============================================================================================

#[derive(Debug)]
struct ServiceEntry {
    size: u32,
    // Bus address once allocated
    addr: Option<u64>,
    pins: u32,
}

#[derive(Debug)]
struct ServiceState {
    region: Region,
    entries: HashMap<u64, ServiceEntry>,
}

/// A memory service running inside the current process over its own region.
///
/// Stands in for the kernel allocator on platforms without one, and enforces the
/// same policy: CPU mappings are refused unless `allow_cpu_map` is set.
#[derive(Debug)]
pub struct LocalMemService {
    arena: PhysArena,
    state: Mutex<ServiceState>,
    next_id: AtomicU64,
    allow_cpu_map: bool,
}

impl LocalMemService {
    /// # Errors
    /// Returns an error if the backing storage cannot be created.
    pub fn new(
        size: u64,
        phys_base: u64,
        granularity: u64,
        allow_cpu_map: bool,
    ) -> std::io::Result<Self> {
        Ok(Self {
            arena: PhysArena::new("memory-service", size, phys_base)?,
            state: Mutex::new(ServiceState {
                region: Region::new(phys_base, phys_base + size, granularity, 0),
                entries: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            allow_cpu_map,
        })
    }

    /// Arena offset of an allocated handle, checked against `[offset, offset + len)`.
    fn storage(&self, id: u64, offset: u64, len: usize) -> Result<u64, ServiceStatus> {
        let state = self.state.lock();
        let entry = state.entries.get(&id).ok_or(ServiceStatus::BadRequest)?;
        let base = entry.addr.ok_or(ServiceStatus::BadRequest)? - self.arena.phys_base();

        match offset.checked_add(len as u64) {
            Some(end) if end <= u64::from(entry.size) => Ok(base + offset),
            _ => Err(ServiceStatus::BadRequest),
        }
    }
}

impl MemService for LocalMemService {
    fn call(&self, request: ServiceRequest) -> Result<u64, ServiceStatus> {
        let mut state = self.state.lock();

        match request {
            ServiceRequest::Create { size } => {
                if size == 0 {
                    return Err(ServiceStatus::BadRequest);
                }
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                state.entries.insert(
                    id,
                    ServiceEntry {
                        size,
                        addr: None,
                        pins: 0,
                    },
                );
                Ok(id)
            }
            ServiceRequest::Alloc { id, align, .. } => {
                let ServiceState { region, entries } = &mut *state;
                let entry = entries.get_mut(&id).ok_or(ServiceStatus::BadRequest)?;
                if entry.addr.is_some() {
                    return Err(ServiceStatus::BadRequest);
                }
                let addr = region
                    .allocate(u64::from(entry.size), u64::from(align))
                    .ok_or(ServiceStatus::NoMemory)?;
                entry.addr = Some(addr);
                Ok(0)
            }
            ServiceRequest::Pin { id } => {
                let entry = state.entries.get_mut(&id).ok_or(ServiceStatus::BadRequest)?;
                let addr = entry.addr.ok_or(ServiceStatus::BadRequest)?;
                entry.pins += 1;
                Ok(addr)
            }
            ServiceRequest::Unpin { id } => {
                let entry = state.entries.get_mut(&id).ok_or(ServiceStatus::BadRequest)?;
                if entry.pins == 0 {
                    return Err(ServiceStatus::BadRequest);
                }
                entry.pins -= 1;
                Ok(0)
            }
            ServiceRequest::Address { id } => {
                let entry = state.entries.get(&id).ok_or(ServiceStatus::BadRequest)?;
                entry.addr.ok_or(ServiceStatus::BadRequest)
            }
            ServiceRequest::Free { id } => {
                let entry = state.entries.remove(&id).ok_or(ServiceStatus::BadRequest)?;
                if entry.pins > 0 {
                    log::warn!("memory service: freeing id {id} with {} pins", entry.pins);
                }
                if let Some(addr) = entry.addr {
                    state.region.free(addr);
                }
                Ok(0)
            }
        }
    }

    fn read(&self, id: u64, offset: u64, buf: &mut [u8]) -> Result<(), ServiceStatus> {
        let at = self.storage(id, offset, buf.len())?;
        self.arena
            .read_at(at, buf)
            .map_err(|_| ServiceStatus::BadRequest)
    }

    fn write(&self, id: u64, offset: u64, data: &[u8]) -> Result<(), ServiceStatus> {
        let at = self.storage(id, offset, data.len())?;
        self.arena
            .write_at(at, data)
            .map_err(|_| ServiceStatus::BadRequest)
    }

    fn map(&self, id: u64) -> Result<CpuMapping, ServiceStatus> {
        if !self.allow_cpu_map {
            return Err(ServiceStatus::AccessDenied);
        }
        let size = {
            let state = self.state.lock();
            state.entries.get(&id).ok_or(ServiceStatus::BadRequest)?.size
        };
        let at = self.storage(id, 0, size as usize)?;
        self.arena
            .map(at, size as usize, AccessFlags::all().to_prot())
            .map_err(|_| ServiceStatus::NoMemory)
    }

    fn usage(&self) -> HeapUsage {
        self.state.lock().region.usage()
    }
}
