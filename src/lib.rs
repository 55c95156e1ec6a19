pub mod error;
pub mod heap;
pub mod mem;
pub mod platform;
pub mod utils;

pub use error::{MemError, MemResult};
pub use heap::{
    AccessFlags, Coherency, CpuMapping, DeviceAddress, HeapBackend, HeapDescriptor, HeapKind,
    HeapUsage, INVALID_ADDRESS, PhysicalLocation,
};
pub use mem::{CacheOp, HandleInfo, MemHandle, MemoryManager};
pub use platform::{HeapConfig, PlatformConfig};
