//! Pools of fixed-size backing blocks.
//!
//! A [`BlockPool`] owns one [`Allocator`] per backing block (a
//! `VkDeviceMemory`, a large buffer, ...). Requests are tried against every
//! block in order and a new block is created only when none of them has a
//! fitting gap.

use crate::allocator::Allocator;
use crate::error::PoolError;

/// Default size of a backing block (64 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

/// Identifies a block inside a [`BlockPool`].
///
/// Ids are handed out in increasing order and never reused by the same pool,
/// so an allocation from a released block cannot resolve to a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// A sub-allocation handed out by a [`BlockPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolAllocation {
    pub block: BlockId,
    pub offset: u64,
    pub size: u64,
}

/// Block pool configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Capacity of newly created blocks.
    ///
    /// Requests larger than this get a dedicated block of exactly their size.
    pub block_size: u64,
    /// Maximum number of live blocks (None for unlimited).
    pub max_blocks: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_blocks: None,
        }
    }
}

impl PoolConfig {
    /// Create a config with the given block size.
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }

    /// Set the block size.
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    /// Limit the number of live blocks.
    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = Some(max_blocks);
        self
    }
}

struct Block<B> {
    id: BlockId,
    backing: B,
    allocator: Allocator,
}

/// First-fit sub-allocation across a growable set of backing blocks.
pub struct BlockPool<B> {
    config: PoolConfig,
    /// Sorted by id, which is also creation order.
    blocks: Vec<Block<B>>,
    next_id: usize,
}

impl<B> BlockPool<B> {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            blocks: Vec::new(),
            next_id: 0,
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Allocate from an existing block without creating a new one.
    pub fn try_alloc(&mut self, size: u64, align: u64) -> Option<PoolAllocation> {
        self.blocks.iter_mut().find_map(|block| {
            // Skip blocks that cannot possibly fit before scanning them.
            if block.allocator.free_bytes() < size {
                return None;
            }
            let offset = block.allocator.alloc(size, align)?;
            Some(PoolAllocation {
                block: block.id,
                offset,
                size,
            })
        })
    }

    /// Allocate `size` bytes, creating a new block through `create` if no
    /// existing block has room.
    ///
    /// `create` receives the capacity of the block to create.
    pub fn alloc<E, F>(&mut self, size: u64, align: u64, create: F) -> Result<PoolAllocation, E>
    where
        E: From<PoolError>,
        F: FnOnce(u64) -> Result<B, E>,
    {
        if let Some(allocation) = self.try_alloc(size, align) {
            return Ok(allocation);
        }

        if let Some(max) = self.config.max_blocks {
            if self.block_count() >= max {
                return Err(PoolError::BlockLimit { max, size }.into());
            }
        }

        let capacity = self.config.block_size.max(size);
        let mut allocator = Allocator::new(capacity);
        // A fresh block of at least `size` bytes fits any non-empty request
        // at offset 0.
        let offset = allocator.alloc(size, align).ok_or(PoolError::ZeroSized)?;

        let backing = create(capacity)?;
        let block = self.push(backing, allocator);

        tracing::debug!(
            block = block.0,
            capacity,
            size,
            "created block for sub-allocation"
        );

        Ok(PoolAllocation {
            block,
            offset,
            size,
        })
    }

    /// Add an externally created block of `capacity` bytes.
    ///
    /// Ignores `max_blocks`; the caller already owns the backing.
    pub fn insert_block(&mut self, backing: B, capacity: u64) -> BlockId {
        self.push(backing, Allocator::new(capacity))
    }

    fn push(&mut self, backing: B, allocator: Allocator) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.blocks.push(Block {
            id,
            backing,
            allocator,
        });
        id
    }

    /// Return a sub-allocation to its block.
    pub fn free(&mut self, allocation: &PoolAllocation) -> Result<(), PoolError> {
        let index = self
            .index_of(allocation.block)
            .ok_or(PoolError::UnknownBlock(allocation.block))?;

        self.blocks[index].allocator.free(allocation.offset)?;
        Ok(())
    }

    /// Remove every block without live allocations and hand back their
    /// backing handles for destruction.
    pub fn release_empty_blocks(&mut self) -> Vec<B> {
        let (empty, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.blocks)
            .into_iter()
            .partition(|block| block.allocator.is_empty());
        self.blocks = live;

        empty
            .into_iter()
            .map(|block| {
                tracing::debug!(block = block.id.0, "releasing empty block");
                block.backing
            })
            .collect()
    }

    /// Remove every block, live allocations included.
    pub fn drain(&mut self) -> Vec<B> {
        self.blocks.drain(..).map(|block| block.backing).collect()
    }

    /// Get the backing handle of a block.
    pub fn block(&self, id: BlockId) -> Option<&B> {
        self.get(id).map(|block| &block.backing)
    }

    /// Get the allocator of a block.
    pub fn block_allocator(&self, id: BlockId) -> Option<&Allocator> {
        self.get(id).map(|block| &block.allocator)
    }

    fn index_of(&self, id: BlockId) -> Option<usize> {
        self.blocks.binary_search_by_key(&id, |block| block.id).ok()
    }

    fn get(&self, id: BlockId) -> Option<&Block<B>> {
        self.index_of(id).map(|index| &self.blocks[index])
    }

    /// Ids of all live blocks, in ascending order.
    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().map(|block| block.id)
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Check if the pool has no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total capacity of all blocks.
    pub fn capacity(&self) -> u64 {
        self.allocators().map(Allocator::capacity).sum()
    }

    /// Bytes held by live sub-allocations across all blocks.
    pub fn used_bytes(&self) -> u64 {
        self.allocators().map(Allocator::used_bytes).sum()
    }

    fn allocators(&self) -> impl Iterator<Item = &Allocator> {
        self.blocks.iter().map(|block| &block.allocator)
    }
}

impl<B> Default for BlockPool<B> {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
