use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use hostforge::backend::host::kernels;
use hostforge::logging::init_logging_default;
use hostforge::{
    AccessMode, BufferStrategy, ComputeDevice, HostDevice, HostDeviceOptions, KernelArg,
    LaunchConfig, ZeroCopyConfig, ZeroCopyContext,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "zerocopy-probe", version)]
#[command(about = "Inspect device zero-copy rules and time buffer mapping", long_about = None)]
struct Cli {
    /// Base alignment the emulated device reports
    #[arg(long, default_value_t = 4096)]
    alignment: usize,
    /// Transfer granularity the emulated device reports
    #[arg(long, default_value_t = 64)]
    granularity: usize,
    /// Make the emulated driver copy host memory instead of using it in place
    #[arg(long)]
    no_host_ptr: bool,
    /// Make every map return a staging copy
    #[arg(long)]
    staging_maps: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the device capabilities as JSON
    Caps,
    /// Run the increment scenario and time the read mapping
    Run {
        /// copy, alloc-host or use-host (default: all three)
        #[arg(long)]
        strategy: Option<String>,
        /// Buffer size in bytes
        #[arg(long, default_value_t = 1 << 20)]
        size: usize,
        /// Timed map/unmap iterations
        #[arg(long, default_value_t = 10)]
        iterations: usize,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
struct StrategyReport {
    requested: BufferStrategy,
    actual: BufferStrategy,
    zero_copy: bool,
    bytes: usize,
    verified: bool,
    map_read_avg_us: f64,
}

fn main() -> anyhow::Result<()> {
    init_logging_default();
    let cli = Cli::parse();

    let options = HostDeviceOptions::default()
        .with_caps(cli.alignment, cli.granularity)
        .with_honor_host_ptr(!cli.no_host_ptr)
        .with_staging_maps(cli.staging_maps);
    let device = HostDevice::with_options(options).context("failed to create device")?;

    match cli.command {
        Commands::Caps => {
            println!("{}", serde_json::to_string_pretty(device.caps())?);
        }
        Commands::Run {
            strategy,
            size,
            iterations,
            json,
        } => {
            let strategies = match strategy {
                Some(name) => vec![BufferStrategy::from_str(&name)
                    .with_context(|| format!("unknown strategy '{}'", name))?],
                None => BufferStrategy::ALL.to_vec(),
            };
            let config = ZeroCopyConfig::from_env()?;
            let ctx = ZeroCopyContext::new(device, config)?;

            let mut reports = Vec::new();
            for strategy in strategies {
                let report = run_strategy(&ctx, strategy, size, iterations.max(1))
                    .with_context(|| format!("strategy {} failed", strategy))?;
                reports.push(report);
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                for r in &reports {
                    println!(
                        "{:<10} -> {:<10} zero_copy={:<5} verified={:<5} {} bytes, map(read) avg {:.1} us",
                        r.requested.as_str(),
                        r.actual.as_str(),
                        r.zero_copy,
                        r.verified,
                        r.bytes,
                        r.map_read_avg_us
                    );
                }
            }
        }
    }
    Ok(())
}

/// Fill word i with i, add one on the device, read back and time the read map
fn run_strategy(
    ctx: &ZeroCopyContext<HostDevice>,
    strategy: BufferStrategy,
    size: usize,
    iterations: usize,
) -> anyhow::Result<StrategyReport> {
    let binding = ctx.create_buffer(strategy, size, AccessMode::ReadWrite)?;
    let words = binding.size() / 4;

    {
        let mut session = ctx.map_for_write(&binding)?;
        for (i, word) in session.as_mut_slice_of::<u32>()?.iter_mut().enumerate() {
            *word = i as u32;
        }
        ctx.unmap(session)?;
    }

    let ticket = ctx.enqueue(
        &kernels::increment_u32(),
        &LaunchConfig::linear(words),
        &[KernelArg::ReadWrite(&binding)],
    )?;
    ctx.wait(ticket)?;

    let mut total = Duration::ZERO;
    let mut verified = true;
    for _ in 0..iterations {
        let start = Instant::now();
        let session = ctx.map_for_read(&binding)?;
        total += start.elapsed();
        verified &= session
            .as_slice_of::<u32>()?
            .iter()
            .enumerate()
            .all(|(i, &w)| w == i as u32 + 1);
        ctx.unmap(session)?;
    }

    Ok(StrategyReport {
        requested: strategy,
        actual: binding.strategy(),
        zero_copy: binding.is_zero_copy(),
        bytes: binding.size(),
        verified,
        map_read_avg_us: total.as_secs_f64() * 1e6 / iterations as f64,
    })
}
