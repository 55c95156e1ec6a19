pub mod arena;
pub mod contiguous;
pub mod iommu;
pub mod region;
pub mod secure;

use crate::error::MemResult;
use bitflags::bitflags;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

/// Address of a buffer as seen by a DMA engine (physical or IOMMU-translated).
pub type DeviceAddress = u64;

/// Returned by address queries that have nothing meaningful to report.
pub const INVALID_ADDRESS: DeviceAddress = u64::MAX;

// ===============================================================================================
// Heap Kinds & Coherency
// ===============================================================================================

pub const HWMEM_HEAPTYPE_SYSTEM: u32 = 0;
pub const HWMEM_HEAPTYPE_CARVEOUT: u32 = 1;
pub const HWMEM_HEAPTYPE_ON_CHIP_FAST: u32 = 2;
pub const HWMEM_HEAPTYPE_SECURED: u32 = 3;
pub const HWMEM_HEAPTYPE_TRANSLATED_IO: u32 = 4;
pub const HWMEM_HEAPTYPE_CAMERA_RESERVED: u32 = 5;
pub const HWMEM_HEAPTYPE_VIDEO_PROTECTED: u32 = 6;

/// Physically distinct memory regions a buffer may live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeapKind {
    /// Ordinary paged system RAM.
    System,
    /// Reserved, physically contiguous region.
    CarveOut,
    /// On-chip fast RAM.
    OnChipFast,
    /// Restricted region owned by the privileged memory service.
    Secured,
    /// Scattered pages made contiguous to devices through an IOMMU.
    TranslatedIo,
    CameraReserved,
    VideoProtected,
}

impl HeapKind {
    pub const ALL: [Self; 7] = [
        Self::System,
        Self::CarveOut,
        Self::OnChipFast,
        Self::Secured,
        Self::TranslatedIo,
        Self::CameraReserved,
        Self::VideoProtected,
    ];

    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            HWMEM_HEAPTYPE_SYSTEM => Some(Self::System),
            HWMEM_HEAPTYPE_CARVEOUT => Some(Self::CarveOut),
            HWMEM_HEAPTYPE_ON_CHIP_FAST => Some(Self::OnChipFast),
            HWMEM_HEAPTYPE_SECURED => Some(Self::Secured),
            HWMEM_HEAPTYPE_TRANSLATED_IO => Some(Self::TranslatedIo),
            HWMEM_HEAPTYPE_CAMERA_RESERVED => Some(Self::CameraReserved),
            HWMEM_HEAPTYPE_VIDEO_PROTECTED => Some(Self::VideoProtected),
            _ => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::CarveOut => "carveout",
            Self::OnChipFast => "on-chip",
            Self::Secured => "secured",
            Self::TranslatedIo => "iommu",
            Self::CameraReserved => "camera",
            Self::VideoProtected => "video-protected",
        }
    }
}

impl fmt::Display for HeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// CPU cache policy for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coherency {
    Uncached,
    WriteCombined,
    WriteBack,
    InnerWriteBack,
}

impl Coherency {
    pub const ALL: [Self; 4] = [
        Self::Uncached,
        Self::WriteCombined,
        Self::WriteBack,
        Self::InnerWriteBack,
    ];

    #[must_use]
    pub const fn as_set(self) -> CoherencySet {
        match self {
            Self::Uncached => CoherencySet::UNCACHED,
            Self::WriteCombined => CoherencySet::WRITE_COMBINED,
            Self::WriteBack => CoherencySet::WRITE_BACK,
            Self::InnerWriteBack => CoherencySet::INNER_WRITE_BACK,
        }
    }

    /// Write-back modes keep dirty lines in the CPU caches.
    #[must_use]
    pub const fn is_cached(self) -> bool {
        matches!(self, Self::WriteBack | Self::InnerWriteBack)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CoherencySet: u8 {
        const UNCACHED = 1 << 0;
        const WRITE_COMBINED = 1 << 1;
        const WRITE_BACK = 1 << 2;
        const INNER_WRITE_BACK = 1 << 3;
    }
}

bitflags! {
    /// CPU access requested for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl AccessFlags {
    pub(crate) const fn to_prot(self) -> libc::c_int {
        let mut prot = libc::PROT_NONE;
        if self.contains(Self::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Self::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        prot
    }
}

// ===============================================================================================
// Heap Descriptor
// ===============================================================================================

/// Static properties of a heap kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapDescriptor {
    /// Storage is one physically contiguous range.
    pub contiguous: bool,
    /// The device address is final once allocated; no page-table programming on pin.
    pub fixed_address: bool,
    /// Minimum alignment the heap imposes on every allocation.
    pub min_alignment: u32,
    /// Cache policies the heap can honor.
    pub coherency: CoherencySet,
    /// Policy substituted when the requested one is not in `coherency`.
    pub fallback_coherency: Coherency,
    /// CPU access the platform permits on mappings of this heap.
    pub cpu_access: AccessFlags,
}

impl HeapDescriptor {
    /// The platform's descriptor for `kind`.
    #[must_use]
    pub fn for_kind(kind: HeapKind, page_size: u32, cache_line: u32) -> Self {
        let all = CoherencySet::all();
        let rw = AccessFlags::READ | AccessFlags::WRITE;

        match kind {
            HeapKind::System => Self {
                contiguous: false,
                fixed_address: true,
                min_alignment: page_size,
                coherency: CoherencySet::WRITE_COMBINED
                    | CoherencySet::WRITE_BACK
                    | CoherencySet::INNER_WRITE_BACK,
                fallback_coherency: Coherency::WriteCombined,
                cpu_access: rw,
            },
            HeapKind::CarveOut | HeapKind::CameraReserved => Self {
                contiguous: true,
                fixed_address: true,
                min_alignment: cache_line,
                coherency: all,
                fallback_coherency: Coherency::Uncached,
                cpu_access: rw,
            },
            HeapKind::OnChipFast => Self {
                contiguous: true,
                fixed_address: true,
                min_alignment: cache_line,
                coherency: CoherencySet::UNCACHED,
                fallback_coherency: Coherency::Uncached,
                cpu_access: rw,
            },
            HeapKind::Secured => Self {
                contiguous: true,
                fixed_address: false,
                min_alignment: page_size,
                coherency: CoherencySet::UNCACHED | CoherencySet::WRITE_COMBINED,
                fallback_coherency: Coherency::Uncached,
                cpu_access: AccessFlags::empty(),
            },
            HeapKind::TranslatedIo => Self {
                contiguous: false,
                fixed_address: false,
                min_alignment: page_size,
                coherency: all,
                fallback_coherency: Coherency::WriteCombined,
                cpu_access: rw,
            },
            HeapKind::VideoProtected => Self {
                contiguous: true,
                fixed_address: true,
                min_alignment: page_size,
                coherency: CoherencySet::UNCACHED | CoherencySet::WRITE_COMBINED,
                fallback_coherency: Coherency::WriteCombined,
                cpu_access: AccessFlags::empty(),
            },
        }
    }

    /// The policy actually applied for a `requested` one.
    #[must_use]
    pub fn effective_coherency(&self, requested: Coherency) -> Coherency {
        if self.coherency.contains(requested.as_set()) {
            requested
        } else {
            self.fallback_coherency
        }
    }
}

// ===============================================================================================
// Locations & Mappings
// ===============================================================================================

/// Where a heap placed an allocation. Opaque outside the owning backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhysicalLocation {
    /// One contiguous range: bus address plus offset into the heap's storage.
    Contiguous { phys: u64, offset: u64, len: usize },
    /// Individually allocated pages, by offset into the heap's page pool. `align` is the
    /// alignment the device-side mapping must honor.
    Pages {
        pages: Arc<[u64]>,
        len: usize,
        align: u64,
    },
    /// Storage owned by the privileged memory service.
    Service { id: u64, len: usize },
}

impl PhysicalLocation {
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::Contiguous { len, .. } | Self::Pages { len, .. } | Self::Service { len, .. } => {
                *len
            }
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live CPU mapping. The region is unmapped when this value is dropped.
#[derive(Debug)]
pub struct CpuMapping {
    base: NonNull<libc::c_void>,
    map_len: usize,
    offset: usize,
    len: usize,
}

// The mapping is plain shared memory; synchronisation of its contents is the caller's business.
unsafe impl Send for CpuMapping {}
unsafe impl Sync for CpuMapping {}

impl CpuMapping {
    /// Wraps an `mmap` region; the buffer starts `offset` bytes into it.
    ///
    /// # Safety
    /// `base..base + map_len` must be a live mapping created by `mmap` that nothing else unmaps,
    /// and `offset + len <= map_len`.
    pub unsafe fn from_raw(
        base: NonNull<libc::c_void>,
        map_len: usize,
        offset: usize,
        len: usize,
    ) -> Self {
        debug_assert!(offset + len <= map_len);
        Self {
            base,
            map_len,
            offset,
            len,
        }
    }

    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        // SAFETY: offset lies inside the mapped region.
        unsafe { self.base.cast::<u8>().add(self.offset) }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `[addr, addr + len)` lies entirely inside this mapping.
    #[must_use]
    pub fn contains(&self, addr: *const u8, len: usize) -> bool {
        let start = self.as_ptr().as_ptr() as usize;
        let addr = addr as usize;
        addr >= start && addr.checked_add(len).is_some_and(|end| end <= start + self.len)
    }
}

impl Drop for CpuMapping {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base.as_ptr(), self.map_len) };
        if ret != 0 {
            log::error!(
                "munmap of {:p} (+0x{:x}) failed: {}",
                self.base,
                self.map_len,
                io::Error::last_os_error()
            );
        }
    }
}

/// Occupancy snapshot of one heap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapUsage {
    pub total: u64,
    pub used: u64,
    pub largest_free: u64,
}

// ===============================================================================================
// Backend Interface
// ===============================================================================================

/// One backing strategy for physical storage.
///
/// Backends are shared between threads but are not expected to be reentrant for
/// allocation: `alloc` and `free` are only called with the allocation lock held.
pub trait HeapBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> HeapKind;

    fn descriptor(&self) -> &HeapDescriptor;

    /// Whether the heap exists on this platform.
    fn is_available(&self) -> bool {
        true
    }

    /// Reserve `size` bytes aligned to `align`.
    ///
    /// Exhaustion must be reported as `MemError::InsufficientMemory` so the selector can
    /// fall through to the next heap; any other error aborts the allocation.
    fn alloc(&self, size: usize, align: usize) -> MemResult<PhysicalLocation>;

    fn free(&self, location: &PhysicalLocation);

    /// Device-visible address of `offset` without any page-table programming.
    fn resolve_address(&self, location: &PhysicalLocation, offset: usize) -> DeviceAddress;

    /// Make the storage visible to devices at one contiguous address.
    fn map_pages(&self, location: &PhysicalLocation) -> MemResult<DeviceAddress> {
        Ok(self.resolve_address(location, 0))
    }

    fn unmap_pages(&self, _location: &PhysicalLocation, _addr: DeviceAddress) {}

    /// Map the whole location for CPU read/write access.
    fn map_cpu(&self, location: &PhysicalLocation) -> MemResult<CpuMapping>;

    /// Copy out of the storage without a CPU mapping.
    fn read(&self, location: &PhysicalLocation, offset: usize, buf: &mut [u8]) -> io::Result<()>;

    /// Copy into the storage without a CPU mapping.
    fn write(&self, location: &PhysicalLocation, offset: usize, data: &[u8]) -> io::Result<()>;

    fn usage(&self) -> HeapUsage;
}
