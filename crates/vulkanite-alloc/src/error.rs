//! Error types for sub-allocation.

use thiserror::Error;

use crate::pool::BlockId;

/// Misuse of an [`Allocator`](crate::Allocator).
///
/// Running out of space is not an error: `alloc` returns `None` for that.
/// These variants indicate a lifetime-tracking bug in the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// `free` was called with an offset that does not start a live allocation.
    #[error("Offset {0} is not allocated")]
    NotAllocated(u64),

    /// `expand` was called with a capacity that does not grow the range.
    #[error("Invalid capacity {requested}: must be greater than current capacity {current}")]
    InvalidCapacity {
        /// Current capacity of the allocator.
        current: u64,
        /// Capacity passed to `expand`.
        requested: u64,
    },
}

/// Errors raised by a [`BlockPool`](crate::BlockPool).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Error from the block's allocator.
    #[error(transparent)]
    Alloc(#[from] AllocError),

    /// The allocation refers to a block that no longer exists.
    #[error("Unknown block: {0:?}")]
    UnknownBlock(BlockId),

    /// Zero-sized requests cannot be placed.
    #[error("Zero-sized allocation")]
    ZeroSized,

    /// No block fits and the pool may not create another one.
    #[error("Block limit reached ({max} blocks), cannot fit {size} bytes")]
    BlockLimit {
        /// Configured maximum number of blocks.
        max: usize,
        /// Size of the request that did not fit.
        size: u64,
    },
}

/// Result type alias for allocator operations.
pub type Result<T> = std::result::Result<T, AllocError>;
