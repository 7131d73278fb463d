//! Device memory management.
//!
//! Large `VkDeviceMemory` blocks are allocated per memory type and carved up
//! with a [`BlockPool`]. Buffers and images are bound at the sub-allocated
//! offset inside their block.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use vulkanite_alloc::{BlockPool, PoolAllocation, PoolConfig, DEFAULT_BLOCK_SIZE};

use crate::error::{GpuError, Result};

/// Find the first memory type allowed by `type_bits` that has all of the
/// `required` property flags.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = usize::min(properties.memory_type_count as usize, vk::MAX_MEMORY_TYPES);
    properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|&(index, memory_type)| {
            type_bits & (1 << index) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(index, _)| index as u32)
}

/// Device memory arena configuration.
#[derive(Debug, Clone, Copy)]
pub struct ArenaConfig {
    /// Size of each `VkDeviceMemory` block.
    pub block_size: u64,
    /// Maximum blocks per memory type (None for unlimited).
    pub max_blocks_per_type: Option<usize>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks_per_type: None,
        }
    }
}

impl ArenaConfig {
    /// Set the block size.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Limit the number of blocks per memory type.
    pub fn with_max_blocks_per_type(mut self, max_blocks: usize) -> Self {
        self.max_blocks_per_type = Some(max_blocks);
        self
    }

    fn pool_config(&self) -> PoolConfig {
        let config = PoolConfig::new(self.block_size);
        match self.max_blocks_per_type {
            Some(max) => config.with_max_blocks(max),
            None => config,
        }
    }
}

/// Parameters for a sub-allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationDesc<'a> {
    /// Debug name, used in logs.
    pub name: &'a str,
    /// Requirements reported by the driver for the resource.
    pub requirements: vk::MemoryRequirements,
    /// Property flags the memory type must have.
    pub flags: vk::MemoryPropertyFlags,
    /// Linear resources (buffers, linear images) and optimal-tiling images
    /// are kept in separate blocks to honour `bufferImageGranularity`.
    pub linear: bool,
}

/// One `VkDeviceMemory` block owned by the arena.
struct DeviceBlock {
    memory: vk::DeviceMemory,
    mapped: Option<NonNull<u8>>,
}

// The mapping is owned by the block and only dereferenced through
// sub-allocations, which never overlap.
unsafe impl Send for DeviceBlock {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    memory_type: u32,
    linear: bool,
}

/// A sub-allocated range of device memory.
#[derive(Debug)]
pub struct MemoryAllocation {
    key: PoolKey,
    region: PoolAllocation,
    memory: vk::DeviceMemory,
    mapped: Option<NonNull<u8>>,
}

unsafe impl Send for MemoryAllocation {}

impl MemoryAllocation {
    /// The block this allocation lives in.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Byte offset within [`memory`](Self::memory).
    pub fn offset(&self) -> u64 {
        self.region.offset
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.region.size
    }

    /// Memory type index of the block.
    pub fn memory_type_index(&self) -> u32 {
        self.key.memory_type
    }

    /// Host pointer to the start of the allocation, if the memory is mapped.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        let offset = self.region.offset as usize;
        self.mapped.map(|base| unsafe { base.as_ptr().add(offset) })
    }
}

/// Device memory arena shared between threads.
pub type SharedMemoryArena = Arc<Mutex<DeviceMemoryArena>>;

/// Sub-allocator for device memory.
///
/// Not thread-safe by itself; wrap it with [`into_shared`](Self::into_shared)
/// to share it.
pub struct DeviceMemoryArena {
    device: Arc<ash::Device>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    config: ArenaConfig,
    pools: HashMap<PoolKey, BlockPool<DeviceBlock>>,
}

impl DeviceMemoryArena {
    /// Create an arena for the given device.
    ///
    /// # Safety
    /// The device must be valid for the lifetime of the arena, and
    /// `memory_properties` must describe its physical device.
    pub unsafe fn new(
        device: Arc<ash::Device>,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        config: ArenaConfig,
    ) -> Self {
        Self {
            device,
            memory_properties,
            config,
            pools: HashMap::new(),
        }
    }

    /// Create an arena, querying memory properties from the physical device.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn from_physical_device(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
        config: ArenaConfig,
    ) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        unsafe { Self::new(device, memory_properties, config) }
    }

    /// Wrap the arena for shared use.
    pub fn into_shared(self) -> SharedMemoryArena {
        Arc::new(Mutex::new(self))
    }

    /// Get the arena configuration.
    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    /// Sub-allocate memory for a resource.
    pub fn allocate(&mut self, desc: &AllocationDesc<'_>) -> Result<MemoryAllocation> {
        let type_bits = desc.requirements.memory_type_bits;
        let flags = desc.flags;
        let Some(memory_type) = find_memory_type(&self.memory_properties, type_bits, flags) else {
            return Err(GpuError::NoSuitableMemoryType { type_bits, flags });
        };
        let host_visible = self.memory_properties.memory_types[memory_type as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);

        let key = PoolKey {
            memory_type,
            linear: desc.linear,
        };
        let device = &self.device;
        let pool_config = self.config.pool_config();
        let pool = self
            .pools
            .entry(key)
            .or_insert_with(|| BlockPool::new(pool_config));

        let size = desc.requirements.size;
        let align = desc.requirements.alignment.max(1);
        let region = pool.alloc(size, align, |capacity| unsafe {
            allocate_block(device, memory_type, capacity, host_visible)
        })?;

        let id = region.block;
        let Some(block) = pool.block(id) else {
            return Err(GpuError::InvalidState(format!("Block {id:?} vanished")));
        };

        tracing::trace!(
            name = desc.name,
            memory_type,
            offset = region.offset,
            size = region.size,
            "sub-allocated device memory"
        );

        Ok(MemoryAllocation {
            key,
            region,
            memory: block.memory,
            mapped: block.mapped,
        })
    }

    /// Return a sub-allocation to the arena.
    ///
    /// The block stays allocated until [`trim`](Self::trim) or shutdown.
    pub fn free(&mut self, allocation: MemoryAllocation) -> Result<()> {
        let pool = self.pools.get_mut(&allocation.key).ok_or_else(|| {
            GpuError::ResourceNotFound(format!("memory type {}", allocation.key.memory_type))
        })?;
        pool.free(&allocation.region)?;
        Ok(())
    }

    /// Create a buffer and bind it to newly sub-allocated memory.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        flags: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<ArenaBuffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(&AllocationDesc {
            name,
            requirements,
            flags,
            linear: true,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation)?;
            return Err(e.into());
        }

        Ok(ArenaBuffer {
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Destroy a buffer and free its memory.
    pub fn free_buffer(&mut self, buffer: &mut ArenaBuffer) -> Result<()> {
        if let Some(allocation) = buffer.allocation.take() {
            self.free(allocation)?;
        }

        unsafe {
            self.device.destroy_buffer(buffer.buffer, None);
        }
        buffer.buffer = vk::Buffer::null();

        Ok(())
    }

    /// Create an image and bind it to newly sub-allocated memory.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        flags: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<ArenaImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(&AllocationDesc {
            name,
            requirements,
            flags,
            linear: create_info.tiling == vk::ImageTiling::LINEAR,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let bound = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation)?;
            return Err(e.into());
        }

        Ok(ArenaImage {
            image,
            allocation: Some(allocation),
            format: create_info.format,
            extent: create_info.extent,
        })
    }

    /// Destroy an image and free its memory.
    pub fn free_image(&mut self, image: &mut ArenaImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.free(allocation)?;
        }

        unsafe {
            self.device.destroy_image(image.image, None);
        }
        image.image = vk::Image::null();

        Ok(())
    }

    /// Free every block that no longer holds sub-allocations.
    pub fn trim(&mut self) {
        let device = &self.device;
        for pool in self.pools.values_mut() {
            for block in pool.release_empty_blocks() {
                unsafe { device.free_memory(block.memory, None) };
            }
        }
        self.pools.retain(|_, pool| !pool.is_empty());
    }

    /// Number of `VkDeviceMemory` blocks currently allocated.
    pub fn block_count(&self) -> usize {
        self.pools.values().map(BlockPool::block_count).sum()
    }

    /// Bytes of device memory reserved in blocks.
    pub fn reserved_bytes(&self) -> u64 {
        self.pools.values().map(BlockPool::capacity).sum()
    }

    /// Bytes handed out to live sub-allocations.
    pub fn used_bytes(&self) -> u64 {
        self.pools.values().map(BlockPool::used_bytes).sum()
    }

    /// Free all device memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Live sub-allocations are logged as leaks.
    pub fn shutdown(&mut self) {
        let leaked = self.used_bytes();
        if leaked > 0 {
            tracing::warn!("Freeing device memory with {leaked} bytes still sub-allocated");
        }

        for (_, mut pool) in self.pools.drain() {
            for block in pool.drain() {
                unsafe { self.device.free_memory(block.memory, None) };
            }
        }
    }
}

impl Drop for DeviceMemoryArena {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Allocate and, for host-visible memory, persistently map a block.
unsafe fn allocate_block(
    device: &ash::Device,
    memory_type: u32,
    capacity: u64,
    host_visible: bool,
) -> Result<DeviceBlock> {
    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(capacity)
        .memory_type_index(memory_type);
    let memory = unsafe { device.allocate_memory(&alloc_info, None)? };

    let mapped = if host_visible {
        match unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) } {
            Ok(ptr) => NonNull::new(ptr.cast::<u8>()),
            Err(e) => {
                unsafe { device.free_memory(memory, None) };
                return Err(e.into());
            }
        }
    } else {
        None
    };

    tracing::debug!(
        memory_type,
        capacity,
        host_visible,
        "allocated device memory block"
    );

    Ok(DeviceBlock { memory, mapped })
}

/// A buffer bound to arena memory.
pub struct ArenaBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Option<MemoryAllocation>,
    pub size: u64,
}

impl ArenaBuffer {
    /// Host pointer to the buffer memory, if it is host-visible.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(MemoryAllocation::mapped_ptr)
    }

    /// Write typed data to the start of the buffer (must be host-visible).
    pub fn write<T: Copy>(&self, data: &[T]) -> Result<()> {
        self.write_range(0, data)
    }

    /// Write raw bytes to the buffer at the given offset (must be host-visible).
    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState("Buffer not mapped".to_string()))?;

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset as usize), data.len());
        }

        Ok(())
    }

    /// Write typed data to the buffer at the given offset (must be host-visible).
    pub fn write_range<T: Copy>(&self, offset: u64, data: &[T]) -> Result<()> {
        let len = std::mem::size_of_val(data);
        let bytes = unsafe { std::slice::from_raw_parts(data.as_ptr().cast::<u8>(), len) };
        self.write_bytes(offset, bytes)
    }
}

/// An image bound to arena memory.
pub struct ArenaImage {
    pub image: vk::Image,
    pub allocation: Option<MemoryAllocation>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}
