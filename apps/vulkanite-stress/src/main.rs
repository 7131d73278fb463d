//! Vulkanite Allocator Stress Harness
//!
//! Runs a seeded random alloc/free workload against the offset allocator and
//! checks every step against a byte-occupancy oracle.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vulkanite-stress -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod config;
mod workload;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{StressConfig, StressTarget};

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = StressConfig::from_args();
    info!(
        "Stressing {:?}: capacity {}, {} iterations, seed {}",
        config.target, config.capacity, config.iterations, config.seed
    );

    let result = match config.target {
        StressTarget::Allocator => workload::run_allocator(&config),
        StressTarget::Pool => workload::run_pool(&config),
    };

    let report = result.inspect_err(|e| error!("Stress run failed: {e:#}"))?;
    info!(
        "Allocations: {} ok, {} failed",
        report.allocations, report.failed_allocations
    );
    info!("Frees: {}", report.frees);
    info!("Peak used: {} bytes", report.peak_used_bytes);
    info!(
        "Final used: {} bytes in {} block(s)",
        report.final_used_bytes, report.blocks
    );
    Ok(())
}

fn print_help() {
    eprintln!(
        "Vulkanite allocator stress harness

USAGE:
    cargo run -p vulkanite-stress -- [OPTIONS]

OPTIONS:
    --capacity <N>      Allocator capacity, or pool block size (default: 4096)
    --iterations <N>    Number of alloc/free steps (default: 10000)
    --seed <N>          RNG seed (default: 42)
    --max-size <N>      Largest request size in bytes (default: 50)
    --alloc-ratio <F>   Probability of an alloc per step (default: 0.6)
    --pool              Drive a block pool instead of a single allocator
    --max-blocks <N>    Block limit in pool mode (default: 8)
    -h, --help          Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG            Set log level (e.g., info, debug, trace)"
    );
}
