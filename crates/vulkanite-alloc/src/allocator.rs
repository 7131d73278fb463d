//! First-fit offset allocator.
//!
//! Hands out non-overlapping, aligned byte ranges from a flat address space
//! `[0, capacity)`. Free space is never stored explicitly: it is the
//! complement of the sorted allocation list, so freeing a region is enough
//! to make its bytes available to the next scan.

use std::fmt;

use crate::error::{AllocError, Result};

/// A live sub-allocation inside an [`Allocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    /// Byte offset from the start of the managed range.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
}

impl Allocation {
    /// One past the last byte of the allocation.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether `offset` lies inside this allocation.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Round `value` up to the next multiple of `align`.
///
/// Returns `None` on overflow.
///
/// # Panics
/// Panics if `align` is not a power of two.
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    assert!(
        align.is_power_of_two(),
        "alignment must be a power of two, got {align}"
    );
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Region allocator over a fixed-size range of bytes.
///
/// Allocation is a linear first-fit scan over the live allocations in offset
/// order, so every operation is O(n) in the number of live allocations.
/// There is no internal locking; callers sharing an allocator across threads
/// must synchronize externally.
#[derive(Debug, Clone, Default)]
pub struct Allocator {
    capacity: u64,
    free_bytes: u64,
    /// Sorted by offset, pairwise disjoint.
    allocations: Vec<Allocation>,
    num_allocs: u64,
    num_frees: u64,
}

impl Allocator {
    /// Create an allocator managing `[0, capacity)`.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            free_bytes: capacity,
            allocations: Vec::new(),
            num_allocs: 0,
            num_frees: 0,
        }
    }

    /// Reserve `size` bytes at an offset that is a multiple of `align`.
    ///
    /// Returns the offset of the first gap, in ascending offset order, that
    /// can hold the request, or `None` if no such gap exists. A failed call
    /// leaves the allocation list and byte counts untouched, but still counts
    /// towards [`num_allocs`](Self::num_allocs). Zero-sized requests always
    /// fail, since they cannot own a unique offset.
    ///
    /// # Panics
    /// Panics if `align` is not a power of two.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        assert!(
            align.is_power_of_two(),
            "alignment must be a power of two, got {align}"
        );
        self.num_allocs += 1;

        let Some((index, offset)) = self.find_gap(size, align) else {
            tracing::trace!(
                size,
                align,
                free = self.free_bytes,
                "no gap large enough for sub-allocation"
            );
            return None;
        };

        self.allocations.insert(index, Allocation { offset, size });
        self.free_bytes -= size;
        Some(offset)
    }

    /// [`alloc`](Self::alloc) with byte alignment.
    pub fn alloc_default(&mut self, size: u64) -> Option<u64> {
        self.alloc(size, 1)
    }

    /// Find the insertion index and offset of the first fitting gap.
    fn find_gap(&self, size: u64, align: u64) -> Option<(usize, u64)> {
        if size == 0 {
            return None;
        }

        let fits = |start: u64, end: u64| end.checked_sub(start).is_some_and(|gap| gap >= size);

        // Offset 0 is aligned for every power of two, so only the starts of
        // gaps after an existing allocation need rounding.
        let mut candidate = 0;
        for (index, allocation) in self.allocations.iter().enumerate() {
            if fits(candidate, allocation.offset) {
                return Some((index, candidate));
            }
            candidate = align_up(allocation.end(), align)?;
        }

        fits(candidate, self.capacity)
            .then_some((self.allocations.len(), candidate))
    }

    /// Release the allocation starting at `offset`.
    ///
    /// `offset` must be exactly the value returned by a previous successful
    /// [`alloc`](Self::alloc); interior addresses are rejected.
    pub fn free(&mut self, offset: u64) -> Result<Allocation> {
        let index = self
            .allocations
            .binary_search_by_key(&offset, |a| a.offset)
            .map_err(|_| AllocError::NotAllocated(offset))?;

        let allocation = self.allocations.remove(index);
        self.free_bytes += allocation.size;
        self.num_frees += 1;
        Ok(allocation)
    }

    /// Drop every allocation at once.
    ///
    /// The lifetime counters are left alone.
    pub fn free_all(&mut self) {
        self.allocations.clear();
        self.free_bytes = self.capacity;
    }

    /// Grow the managed range to `new_capacity` bytes.
    ///
    /// Existing allocations keep their offsets.
    pub fn expand(&mut self, new_capacity: u64) -> Result<()> {
        if new_capacity <= self.capacity {
            return Err(AllocError::InvalidCapacity {
                current: self.capacity,
                requested: new_capacity,
            });
        }

        self.free_bytes += new_capacity - self.capacity;
        self.capacity = new_capacity;
        Ok(())
    }

    /// Whether the byte at `offset` belongs to any live allocation.
    pub fn is_allocated(&self, offset: u64) -> bool {
        let after = self.allocations.partition_point(|a| a.offset <= offset);
        after > 0 && self.allocations[after - 1].contains(offset)
    }

    /// Total size of the managed range.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes held by live allocations.
    pub fn used_bytes(&self) -> u64 {
        self.capacity - self.free_bytes
    }

    /// Bytes not held by any allocation (possibly fragmented).
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Live allocations in ascending offset order.
    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    /// Whether there are no live allocations.
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Number of `alloc` calls made, including failed ones.
    pub fn num_allocs(&self) -> u64 {
        self.num_allocs
    }

    /// Number of successful `free` calls made.
    pub fn num_frees(&self) -> u64 {
        self.num_frees
    }

    /// Size of the largest contiguous free region, ignoring alignment.
    pub fn largest_free_gap(&self) -> u64 {
        let mut largest = 0;
        let mut start = 0;
        for allocation in &self.allocations {
            largest = largest.max(allocation.offset - start);
            start = allocation.end();
        }
        largest.max(self.capacity - start)
    }

    /// Snapshot of the allocator's bookkeeping.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            capacity: self.capacity,
            used_bytes: self.used_bytes(),
            free_bytes: self.free_bytes,
            allocation_count: self.allocations.len(),
            largest_free_gap: self.largest_free_gap(),
            num_allocs: self.num_allocs,
            num_frees: self.num_frees,
        }
    }
}

/// Point-in-time summary of an [`Allocator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub capacity: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub allocation_count: usize,
    pub largest_free_gap: u64,
    pub num_allocs: u64,
    pub num_frees: u64,
}

impl fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} bytes used in {} allocations (largest gap {}, {} allocs, {} frees)",
            self.used_bytes,
            self.capacity,
            self.allocation_count,
            self.largest_free_gap,
            self.num_allocs,
            self.num_frees
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn regions(allocator: &Allocator) -> Vec<(u64, u64)> {
        allocator
            .allocations()
            .iter()
            .map(|a| (a.offset, a.size))
            .collect()
    }

    #[test]
    fn sequential_allocations() {
        let mut allocator = Allocator::new(100);

        assert_eq!(allocator.alloc(10, 1), Some(0));
        assert_eq!(allocator.alloc(10, 1), Some(10));

        assert_eq!(allocator.num_allocs(), 2);
        assert_eq!(allocator.used_bytes(), 20);
        assert_eq!(allocator.free_bytes(), 80);
        assert_eq!(regions(&allocator), vec![(0, 10), (10, 10)]);
    }

    #[test]
    fn free_and_double_free() {
        let mut allocator = Allocator::new(100);
        allocator.alloc(10, 1);
        allocator.alloc(10, 1);

        let freed = allocator.free(0).unwrap();
        assert_eq!(
            freed,
            Allocation {
                offset: 0,
                size: 10
            }
        );
        assert_eq!(allocator.num_frees(), 1);
        assert_eq!(allocator.used_bytes(), 10);
        assert_eq!(allocator.free_bytes(), 90);
        assert_eq!(regions(&allocator), vec![(10, 10)]);

        assert_eq!(allocator.free(0), Err(AllocError::NotAllocated(0)));
        assert_eq!(allocator.num_frees(), 1);
    }

    #[test]
    fn free_rejects_interior_offset() {
        let mut allocator = Allocator::new(100);
        allocator.alloc(10, 1);

        assert_eq!(allocator.free(5), Err(AllocError::NotAllocated(5)));
        assert_eq!(allocator.used_bytes(), 10);
    }

    #[test]
    fn aligned_allocations() {
        let mut allocator = Allocator::new(100);

        assert_eq!(allocator.alloc(11, 8), Some(0));
        assert_eq!(allocator.alloc(11, 8), Some(16));
        assert_eq!(allocator.alloc(11, 8), Some(32));
        assert_eq!(allocator.used_bytes(), 33);
    }

    #[test]
    fn expand_grows_only() {
        let mut allocator = Allocator::new(0);
        assert_eq!(allocator.alloc(1, 1), None);

        allocator.expand(100).unwrap();
        assert_eq!(allocator.capacity(), 100);
        assert_eq!(allocator.free_bytes(), 100);
        assert_eq!(allocator.used_bytes(), 0);

        assert_eq!(allocator.alloc(50, 1), Some(0));
        allocator.expand(200).unwrap();
        assert_eq!(allocator.free_bytes(), 150);
        assert_eq!(regions(&allocator), vec![(0, 50)]);

        assert_eq!(
            allocator.expand(190),
            Err(AllocError::InvalidCapacity {
                current: 200,
                requested: 190
            })
        );
        assert!(allocator.expand(200).is_err());
        assert_eq!(allocator.capacity(), 200);
    }

    #[test]
    fn free_all_keeps_counters() {
        let mut allocator = Allocator::new(64);
        for _ in 0..4 {
            allocator.alloc(8, 4);
        }
        allocator.free(8).unwrap();

        allocator.free_all();
        assert_eq!(allocator.used_bytes(), 0);
        assert_eq!(allocator.free_bytes(), 64);
        assert!(allocator.allocations().is_empty());
        assert_eq!(allocator.num_allocs(), 4);
        assert_eq!(allocator.num_frees(), 1);
    }

    #[test]
    fn failed_alloc_counts_but_does_not_mutate() {
        let mut allocator = Allocator::new(32);
        assert_eq!(allocator.alloc(32, 1), Some(0));

        assert_eq!(allocator.alloc(1, 1), None);
        assert_eq!(allocator.alloc(1, 16), None);
        assert_eq!(allocator.num_allocs(), 3);
        assert_eq!(allocator.free_bytes(), 0);
        assert_eq!(regions(&allocator), vec![(0, 32)]);
    }

    #[test]
    fn first_fit_reuses_earliest_gap() {
        let mut allocator = Allocator::new(100);
        for _ in 0..5 {
            allocator.alloc(10, 1);
        }
        allocator.free(10).unwrap();
        allocator.free(30).unwrap();

        assert_eq!(allocator.alloc(10, 1), Some(10));
        assert_eq!(allocator.alloc(5, 1), Some(30));
        assert_eq!(allocator.alloc(5, 1), Some(35));
        assert_eq!(allocator.alloc(5, 1), Some(50));
    }

    #[test]
    fn alignment_skips_gap_too_small_after_rounding() {
        let mut allocator = Allocator::new(64);
        allocator.alloc(9, 1);
        allocator.alloc(7, 1);
        allocator.alloc(8, 1);
        allocator.free(9).unwrap();

        // Gap [9, 16) rounds up to 16, which is occupied.
        assert_eq!(allocator.alloc(4, 16), Some(32));
        // Unaligned requests still see the gap.
        assert_eq!(allocator.alloc(7, 1), Some(9));
    }

    #[test]
    fn zero_sized_request_fails() {
        let mut allocator = Allocator::new(16);
        assert_eq!(allocator.alloc(0, 1), None);
        assert_eq!(allocator.num_allocs(), 1);
        assert!(allocator.is_empty());
    }

    #[test]
    fn is_allocated_checks_every_byte() {
        let mut allocator = Allocator::new(32);
        allocator.alloc(4, 1);
        allocator.alloc(4, 8);

        assert!(allocator.is_allocated(0));
        assert!(allocator.is_allocated(3));
        assert!(!allocator.is_allocated(4));
        assert!(!allocator.is_allocated(7));
        assert!(allocator.is_allocated(8));
        assert!(allocator.is_allocated(11));
        assert!(!allocator.is_allocated(12));
        assert!(!allocator.is_allocated(1000));
    }

    #[test]
    fn largest_free_gap_tracks_fragmentation() {
        let mut allocator = Allocator::new(100);
        assert_eq!(allocator.largest_free_gap(), 100);

        allocator.alloc(10, 1);
        allocator.alloc(30, 1);
        allocator.alloc(10, 1);
        assert_eq!(allocator.largest_free_gap(), 50);

        allocator.free(10).unwrap();
        assert_eq!(allocator.largest_free_gap(), 50);

        allocator.alloc(45, 1);
        assert_eq!(allocator.largest_free_gap(), 30);
    }

    #[test]
    fn stats_summary() {
        let mut allocator = Allocator::new(128);
        allocator.alloc(32, 1);
        allocator.alloc(1000, 1);

        let stats = allocator.stats();
        assert_eq!(stats.used_bytes, 32);
        assert_eq!(stats.free_bytes, 96);
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.num_allocs, 2);
        assert_eq!(
            stats.to_string(),
            "32/128 bytes used in 1 allocations (largest gap 96, 2 allocs, 0 frees)"
        );
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn non_power_of_two_alignment_panics() {
        let mut allocator = Allocator::new(100);
        allocator.alloc(10, 3);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn zero_alignment_panics() {
        let mut allocator = Allocator::new(100);
        allocator.alloc(10, 0);
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(9, 8), Some(16));
        assert_eq!(align_up(16, 16), Some(16));
        assert_eq!(align_up(u64::MAX, 2), None);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn align_up_rejects_zero_alignment() {
        let _ = align_up(0, 0);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn align_up_rejects_non_power_of_two() {
        let _ = align_up(10, 6);
    }

    #[test]
    fn huge_alignment_does_not_overflow() {
        let mut allocator = Allocator::new(u64::MAX);
        assert_eq!(allocator.alloc(1, 1), Some(0));
        assert_eq!(allocator.alloc(1, 1 << 63), Some(1 << 63));
        assert_eq!(allocator.alloc(1, 1 << 63), None);
    }

    /// Lowest offset that is a multiple of `align` and whose `size` bytes
    /// are all free in the oracle.
    fn oracle_first_fit(occupied: &[bool], size: u64, align: u64) -> Option<u64> {
        let size = size as usize;
        (0..occupied.len())
            .step_by(align as usize)
            .find(|&start| {
                start + size <= occupied.len() && !occupied[start..start + size].contains(&true)
            })
            .map(|start| start as u64)
    }

    #[test]
    fn random_workload_matches_byte_oracle() {
        const CAPACITY: usize = 512;
        const ALIGNS: [u64; 5] = [1, 2, 4, 8, 16];

        let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
        let mut allocator = Allocator::new(CAPACITY as u64);
        let mut occupied = vec![false; CAPACITY];
        let mut live: Vec<(u64, u64)> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..=50u64);
                let align = ALIGNS[rng.gen_range(0..ALIGNS.len())];
                let expected = oracle_first_fit(&occupied, size, align);
                let free_before = allocator.free_bytes();

                let offset = allocator.alloc(size, align);
                assert_eq!(offset, expected, "alloc({size}, {align})");

                match offset {
                    Some(offset) => {
                        assert_eq!(offset % align, 0);
                        for byte in &mut occupied[offset as usize..(offset + size) as usize] {
                            assert!(!*byte);
                            *byte = true;
                        }
                        live.push((offset, size));
                    }
                    None => assert_eq!(allocator.free_bytes(), free_before),
                }
            } else {
                let (offset, size) = live.swap_remove(rng.gen_range(0..live.len()));
                let freed = allocator.free(offset).unwrap();
                assert_eq!(freed.size, size);
                occupied[offset as usize..(offset + size) as usize].fill(false);
            }

            let used = occupied.iter().filter(|&&b| b).count() as u64;
            assert_eq!(allocator.used_bytes(), used);
            assert_eq!(
                allocator.used_bytes() + allocator.free_bytes(),
                CAPACITY as u64
            );
            for (byte, &expected) in occupied.iter().enumerate() {
                assert_eq!(allocator.is_allocated(byte as u64), expected, "byte {byte}");
            }
        }

        for (offset, _) in live.drain(..) {
            allocator.free(offset).unwrap();
        }
        assert!(allocator.is_empty());
        assert_eq!(allocator.free_bytes(), CAPACITY as u64);
    }
}
