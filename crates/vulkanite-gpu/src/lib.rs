//! Vulkan memory layer for Vulkanite.
//!
//! This crate provides:
//! - Memory type selection
//! - Device memory sub-allocation via `vulkanite-alloc`
//! - Buffer and image creation bound to sub-allocated memory

pub mod error;
pub mod memory;

pub use error::{GpuError, Result};
pub use memory::{
    find_memory_type, AllocationDesc, ArenaBuffer, ArenaConfig, ArenaImage, DeviceMemoryArena,
    MemoryAllocation, SharedMemoryArena,
};
