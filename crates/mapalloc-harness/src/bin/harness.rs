//! CLI entrypoint for the mapalloc stress harness.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use mapalloc::{Heap, HeapConfig, ReclaimPolicy};
use mapalloc_harness::workload::{self, ChurnParams, ThreadedParams};
use mapalloc_harness::{HarnessError, RunReport, parse_seed};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Stress scenarios for mapalloc.
#[derive(Debug, Parser)]
#[command(name = "mapalloc-harness")]
#[command(about = "Stress harness for the mapalloc page-mapped allocator")]
struct Cli {
    /// Reclaim policy (`eager` or `retain`); defaults to MAPALLOC_RECLAIM.
    #[arg(long, global = true)]
    reclaim: Option<String>,
    /// Poison freed slots and verify on reuse.
    #[arg(long, global = true)]
    poison: Option<bool>,
    /// Write the JSON report here instead of stdout.
    #[arg(long, global = true)]
    output: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Single-threaded random allocate/release churn.
    Churn {
        #[arg(long, default_value_t = 1_000_000)]
        ops: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0x9E37_79B9_7F4A_7C15")]
        seed: String,
        /// Maximum simultaneously live allocations.
        #[arg(long, default_value_t = 512)]
        live: usize,
        /// Largest large-path request in bytes.
        #[arg(long, default_value_t = 64 * 1024)]
        max_large: usize,
    },
    /// Worker threads release a shared set while the main thread allocates.
    Threaded {
        #[arg(long, default_value_t = 8)]
        threads: usize,
        #[arg(long, default_value_t = 4_000)]
        per_thread: usize,
        #[arg(long, default_value_t = 20_000)]
        rounds: usize,
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
    },
}

fn heap_config(cli: &Cli) -> HeapConfig {
    let mut config = mapalloc::config::process_config();
    if let Some(raw) = &cli.reclaim {
        config = config.with_reclaim(ReclaimPolicy::from_str_loose(raw));
    }
    if let Some(poison) = cli.poison {
        config = config.with_poison(poison);
    }
    config
}

fn emit<T: Serialize>(report: &RunReport<T>, output: Option<&Path>) -> Result<(), HarnessError> {
    let body = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => std::fs::write(path, body)?,
        None => println!("{body}"),
    }
    if report.within_bound() {
        Ok(())
    } else {
        Err(HarnessError::RegionBound {
            outstanding: report.outstanding_after,
            bound: report.region_bound,
        })
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = heap_config(&cli);
    let heap = Heap::with_config(config);
    tracing::info!(reclaim = ?config.reclaim, poison = config.poison_freed, "heap configured");

    match &cli.command {
        Command::Churn {
            ops,
            seed,
            live,
            max_large,
        } => {
            let params = ChurnParams {
                ops: *ops,
                seed: parse_seed(seed)?,
                live_cap: *live,
                max_large: *max_large,
            };
            let start = Instant::now();
            let outcome = workload::churn(&heap, &params)?;
            let report = RunReport::finish("churn", params.seed, &heap, elapsed_ms(start), outcome);
            emit(&report, cli.output.as_deref())?;
        }
        Command::Threaded {
            threads,
            per_thread,
            rounds,
            seed,
        } => {
            let params = ThreadedParams {
                threads: *threads,
                per_thread: *per_thread,
                main_rounds: *rounds,
                seed: parse_seed(seed)?,
            };
            let start = Instant::now();
            let outcome = workload::threaded_release(&heap, &params)?;
            let report =
                RunReport::finish("threaded", params.seed, &heap, elapsed_ms(start), outcome);
            emit(&report, cli.output.as_deref())?;
        }
    }
    Ok(())
}
