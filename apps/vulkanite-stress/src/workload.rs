//! Randomized alloc/free workload checked against a byte-occupancy oracle.

use std::collections::HashMap;

use anyhow::{bail, ensure, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vulkanite_alloc::{Allocator, BlockId, BlockPool, PoolAllocation, PoolConfig, PoolError};

use crate::config::StressConfig;

const ALIGNMENTS: [u64; 5] = [1, 2, 4, 8, 16];

/// Outcome of a stress run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StressReport {
    pub iterations: usize,
    pub allocations: u64,
    pub failed_allocations: u64,
    pub frees: u64,
    pub peak_used_bytes: u64,
    pub final_used_bytes: u64,
    pub blocks: usize,
}

/// Byte map of one address range.
struct Oracle {
    occupied: Vec<bool>,
}

impl Oracle {
    fn new(capacity: u64) -> Self {
        Self {
            occupied: vec![false; capacity as usize],
        }
    }

    fn claim(&mut self, offset: u64, size: u64) -> Result<()> {
        let range = offset as usize..(offset + size) as usize;
        let bytes = self
            .occupied
            .get_mut(range)
            .with_context(|| format!("allocation {offset}+{size} is out of range"))?;
        ensure!(
            !bytes.contains(&true),
            "allocation {offset}+{size} overlaps a live allocation"
        );
        bytes.fill(true);
        Ok(())
    }

    fn release(&mut self, offset: u64, size: u64) {
        self.occupied[offset as usize..(offset + size) as usize].fill(false);
    }

    fn verify(&self, allocator: &Allocator) -> Result<()> {
        for (byte, &expected) in self.occupied.iter().enumerate() {
            if allocator.is_allocated(byte as u64) != expected {
                bail!("byte {byte}: oracle says {expected}, allocator disagrees");
            }
        }
        let used = self.occupied.iter().filter(|&&b| b).count() as u64;
        ensure!(
            allocator.used_bytes() == used,
            "allocator reports {} used bytes, oracle counts {used}",
            allocator.used_bytes()
        );
        ensure!(
            allocator.used_bytes() + allocator.free_bytes() == allocator.capacity(),
            "used + free does not add up to capacity"
        );
        Ok(())
    }
}

struct Request {
    size: u64,
    align: u64,
}

fn next_request(rng: &mut StdRng, config: &StressConfig) -> Request {
    Request {
        size: rng.gen_range(1..=config.max_size),
        align: ALIGNMENTS[rng.gen_range(0..ALIGNMENTS.len())],
    }
}

/// Drive a single `Allocator`.
pub fn run_allocator(config: &StressConfig) -> Result<StressReport> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut allocator = Allocator::new(config.capacity);
    let mut oracle = Oracle::new(config.capacity);
    let mut live: Vec<(u64, u64)> = Vec::new();
    let mut report = StressReport {
        iterations: config.iterations,
        blocks: 1,
        ..Default::default()
    };

    for step in 0..config.iterations {
        if live.is_empty() || rng.gen_bool(config.alloc_ratio) {
            let request = next_request(&mut rng, config);
            let free_before = allocator.free_bytes();
            match allocator.alloc(request.size, request.align) {
                Some(offset) => {
                    ensure!(
                        offset % request.align == 0,
                        "step {step}: offset {offset} not aligned to {}",
                        request.align
                    );
                    oracle
                        .claim(offset, request.size)
                        .with_context(|| format!("step {step}"))?;
                    live.push((offset, request.size));
                    report.allocations += 1;
                }
                None => {
                    ensure!(
                        allocator.free_bytes() == free_before,
                        "step {step}: failed alloc changed free bytes"
                    );
                    report.failed_allocations += 1;
                }
            }
        } else {
            let (offset, size) = live.swap_remove(rng.gen_range(0..live.len()));
            allocator
                .free(offset)
                .with_context(|| format!("step {step}: freeing live offset {offset}"))?;
            oracle.release(offset, size);
            report.frees += 1;
        }

        oracle
            .verify(&allocator)
            .with_context(|| format!("step {step}"))?;
        report.peak_used_bytes = report.peak_used_bytes.max(allocator.used_bytes());
    }

    ensure!(
        allocator.num_allocs() == report.allocations + report.failed_allocations,
        "alloc call counter out of sync"
    );
    ensure!(
        allocator.num_frees() == report.frees,
        "free counter out of sync"
    );

    report.final_used_bytes = allocator.used_bytes();
    tracing::info!("Allocator: {}", allocator.stats());
    Ok(report)
}

/// Drive a `BlockPool` of `capacity`-sized blocks.
pub fn run_pool(config: &StressConfig) -> Result<StressReport> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let pool_config = PoolConfig {
        block_size: config.capacity,
        max_blocks: Some(config.max_blocks),
    };
    let mut pool: BlockPool<()> = BlockPool::new(pool_config);
    let mut oracles: HashMap<BlockId, Oracle> = HashMap::new();
    let mut live: Vec<PoolAllocation> = Vec::new();
    let mut report = StressReport {
        iterations: config.iterations,
        ..Default::default()
    };

    for step in 0..config.iterations {
        if live.is_empty() || rng.gen_bool(config.alloc_ratio) {
            let request = next_request(&mut rng, config);
            match pool.alloc(request.size, request.align, |_| Ok::<_, PoolError>(())) {
                Ok(allocation) => {
                    let capacity = pool
                        .block_allocator(allocation.block)
                        .map(Allocator::capacity)
                        .context("allocation points at a missing block")?;
                    oracles
                        .entry(allocation.block)
                        .or_insert_with(|| Oracle::new(capacity))
                        .claim(allocation.offset, allocation.size)
                        .with_context(|| format!("step {step}, block {:?}", allocation.block))?;
                    live.push(allocation);
                    report.allocations += 1;
                }
                Err(PoolError::BlockLimit { .. }) => report.failed_allocations += 1,
                Err(e) => bail!("step {step}: {e}"),
            }
        } else {
            let allocation = live.swap_remove(rng.gen_range(0..live.len()));
            pool.free(&allocation)
                .with_context(|| format!("step {step}: freeing {allocation:?}"))?;
            if let Some(oracle) = oracles.get_mut(&allocation.block) {
                oracle.release(allocation.offset, allocation.size);
            }
            report.frees += 1;
        }

        if step % 64 == 63 {
            let released = pool.release_empty_blocks().len();
            if released > 0 {
                oracles.retain(|id, _| pool.block(*id).is_some());
                tracing::debug!(step, released, "released empty blocks");
            }
        }

        for (id, oracle) in &oracles {
            let allocator = pool
                .block_allocator(*id)
                .with_context(|| format!("step {step}: block {id:?} vanished"))?;
            oracle
                .verify(allocator)
                .with_context(|| format!("step {step}, block {id:?}"))?;
        }
        report.peak_used_bytes = report.peak_used_bytes.max(pool.used_bytes());
    }

    report.final_used_bytes = pool.used_bytes();
    report.blocks = pool.block_count();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StressTarget;

    fn small_config(target: StressTarget) -> StressConfig {
        StressConfig {
            capacity: 512,
            iterations: 1500,
            seed: 1234,
            max_blocks: 4,
            target,
            ..Default::default()
        }
    }

    #[test]
    fn allocator_workload_passes() {
        let config = small_config(StressTarget::Allocator);
        let report = run_allocator(&config).unwrap();
        assert_eq!(report.iterations, 1500);
        assert!(report.allocations > 0);
        assert!(report.frees > 0);
        assert!(report.peak_used_bytes <= 512);
    }

    #[test]
    fn allocator_workload_is_deterministic() {
        let config = small_config(StressTarget::Allocator);
        let first = run_allocator(&config).unwrap();
        let second = run_allocator(&config).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exhausting_workload_records_failures() {
        let config = StressConfig {
            capacity: 64,
            alloc_ratio: 1.0,
            iterations: 200,
            ..small_config(StressTarget::Allocator)
        };
        let report = run_allocator(&config).unwrap();
        assert!(report.failed_allocations > 0);
        assert_eq!(report.frees, 0);
    }

    #[test]
    fn pool_workload_passes() {
        let report = run_pool(&small_config(StressTarget::Pool)).unwrap();
        assert!(report.allocations > 0);
        assert!(report.blocks <= 4);
        assert!(report.peak_used_bytes <= 4 * 512);
    }
}
