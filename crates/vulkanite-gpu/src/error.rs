//! GPU error types.

use ash::vk;
use thiserror::Error;
use vulkanite_alloc::PoolError;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Sub-allocation failed.
    #[error("Sub-allocation failed: {0}")]
    Pool(#[from] PoolError),

    /// No memory type satisfies the resource requirements.
    #[error("No suitable memory type (type bits {type_bits:#b}, flags {flags:?})")]
    NoSuitableMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
