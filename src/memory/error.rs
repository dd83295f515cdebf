//! Allocation errors
use thiserror::Error;

/// Failure to acquire memory from the OS
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    #[error("region size must be a power of two multiple of the page size")]
    BadSize,
    #[error("the OS refused to map memory")]
    OutOfMemory,
}

/// Failure to satisfy an allocation request
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("invalid allocation size: requested {bytes} bytes, maximum is {max} bytes")]
    BadRequest { bytes: usize, max: usize },
    #[error("out of memory: could not map a new arena")]
    OutOfMemory,
    #[error(transparent)]
    Region(RegionError),
}

impl From<RegionError> for AllocError {
    fn from(e: RegionError) -> Self {
        match e {
            RegionError::BadSize => AllocError::Region(e),
            RegionError::OutOfMemory => AllocError::OutOfMemory,
        }
    }
}
