pub mod access;
pub mod coherency;
pub mod handle;
pub mod manager;
pub mod mapper;
pub mod pin;
pub mod selector;

pub use coherency::CacheOp;
pub use handle::{HandleInfo, MemHandle};
pub use manager::MemoryManager;
pub use selector::{HeapSelector, Placement};
