//! Stress run configuration.

use tracing::warn;

/// Largest capacity the byte-occupancy oracle will track (64 MiB).
pub const MAX_CAPACITY: u64 = 64 * 1024 * 1024;

/// Which allocator front-end the workload drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StressTarget {
    /// A single `Allocator`.
    Allocator,
    /// A `BlockPool` whose blocks are `capacity` bytes each.
    Pool,
}

/// Configuration for a stress run (from CLI or defaults).
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Capacity of the allocator, or of each pool block.
    pub capacity: u64,
    /// Number of alloc/free steps.
    pub iterations: usize,
    /// RNG seed.
    pub seed: u64,
    /// Largest request size; sizes are drawn from `1..=max_size`.
    pub max_size: u64,
    /// Probability of an alloc (vs. a free) per step.
    pub alloc_ratio: f64,
    /// Maximum number of pool blocks.
    pub max_blocks: usize,
    pub target: StressTarget,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            iterations: 10_000,
            seed: 42,
            max_size: 50,
            alloc_ratio: 0.6,
            max_blocks: 8,
            target: StressTarget::Allocator,
        }
    }
}

impl StressConfig {
    /// Parse the configuration from command line arguments.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse the configuration from an argument list (without the program name).
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        let args: Vec<S> = args.into_iter().collect();

        let mut i = 0;
        while i < args.len() {
            let flag = args[i].as_ref();
            let value = args.get(i + 1).map(|v| v.as_ref());
            let consumed = match flag {
                "--capacity" => parse_into(flag, value, &mut config.capacity),
                "--iterations" => parse_into(flag, value, &mut config.iterations),
                "--seed" => parse_into(flag, value, &mut config.seed),
                "--max-size" => parse_into(flag, value, &mut config.max_size),
                "--alloc-ratio" => parse_into(flag, value, &mut config.alloc_ratio),
                "--max-blocks" => parse_into(flag, value, &mut config.max_blocks),
                "--pool" => {
                    config.target = StressTarget::Pool;
                    false
                }
                other => {
                    warn!("Ignoring unknown argument {other}");
                    false
                }
            };
            i += if consumed { 2 } else { 1 };
        }

        if config.capacity > MAX_CAPACITY {
            warn!(
                "Capacity {} exceeds the oracle limit, clamping to {MAX_CAPACITY}",
                config.capacity
            );
            config.capacity = MAX_CAPACITY;
        }
        config.max_size = config.max_size.clamp(1, MAX_CAPACITY);
        config.alloc_ratio = config.alloc_ratio.clamp(0.0, 1.0);
        config.max_blocks = config.max_blocks.max(1);
        config
    }
}

/// Parse `value` into `slot`. Returns whether the value was consumed.
fn parse_into<T: std::str::FromStr>(flag: &str, value: Option<&str>, slot: &mut T) -> bool {
    match value.map(str::parse) {
        Some(Ok(parsed)) => {
            *slot = parsed;
            true
        }
        Some(Err(_)) => {
            warn!("Invalid value for {flag}: {}", value.unwrap_or_default());
            true
        }
        None => {
            warn!("Missing value for {flag}");
            false
        }
    }
}
