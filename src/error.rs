//! # Errors
//!
//! Error taxonomy of the direct memory layer.

use thiserror::Error;

use crate::memory::backend::BackendKind;

/// Direct memory errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// Allocation requested with a size of zero
    #[error("Invalid allocation size: {size}")]
    InvalidSize { size: usize },

    /// Backend could not satisfy the request
    #[error("{backend:?} backend failed to allocate {size} bytes")]
    AllocationFailed { size: usize, backend: BackendKind },

    /// Safe-mode access outside of the block
    #[error("Access of {length} bytes at offset {offset} is out of bounds of block with capacity {capacity}")]
    BoundsViolation {
        offset: usize,
        length: usize,
        capacity: usize,
    },

    /// Free of an already released or unregistered block
    #[error("Double free of direct memory block of {size} bytes")]
    DoubleFree { size: usize },

    /// Access through a released handle
    #[error("Direct memory pointer was used after it has been freed")]
    UseAfterFree,

    /// Configuration rejected
    #[error("Invalid direct memory configuration: {0}")]
    InvalidConfig(String),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, MemoryError>;
