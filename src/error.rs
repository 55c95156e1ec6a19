use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Insufficient memory in every candidate heap")]
    InsufficientMemory,

    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Handle already has backing storage")]
    AlreadyAllocated,

    #[error("Not supported on this platform: {0}")]
    NotSupported(String),

    #[error("Access denied by the memory service")]
    AccessDenied,

    #[error("Invalid address")]
    InvalidAddress,

    #[error("Mapping failed: {0}")]
    MappingFailed(String),

    #[error("Memory service error: {0}")]
    Service(String),
}

// A convenient alias
pub type MemResult<T> = Result<T, MemError>;
