use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IpcError>;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("shared memory region not found: {0}")]
    NotFound(String),

    #[error("shared memory region already exists: {0}")]
    AlreadyExists(String),

    #[error("region is not compatible with this protocol: {0}")]
    IncompatibleRegion(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("payload of {len} bytes exceeds the capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("the region has been closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
