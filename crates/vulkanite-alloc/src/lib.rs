//! Offset sub-allocation for the Vulkanite layer.
//!
//! This crate provides:
//! - [`Allocator`]: first-fit, alignment-aware allocator over a flat byte range
//! - [`BlockPool`]: one allocator per backing block, with on-demand block creation
//!
//! Both are plain single-threaded data structures. Running out of space is an
//! expected outcome and is reported with `None`; freeing an unknown offset or
//! shrinking an allocator are caller bugs and are reported as errors.

pub mod allocator;
pub mod error;
pub mod pool;

pub use allocator::{align_up, Allocation, Allocator, AllocatorStats};
pub use error::{AllocError, PoolError, Result};
pub use pool::{BlockId, BlockPool, PoolAllocation, PoolConfig, DEFAULT_BLOCK_SIZE};
