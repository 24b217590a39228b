//! Stencil runner
//!
//! ```bash
//! # 4 work-blocks per shard, 10 iterations, 1024x1024 grid, 4 shards
//! stencil 4 10 1024 4
//!
//! # two nodes of two shards each, radius 3, pinned threads
//! stencil 4 10 1024 2 --nodes 2 --radius 3 --pin
//! ```

use clap::Parser;
use spmd_stencil::prelude::*;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Star-stencil update over a tiled 2-D grid, one shard per tile
#[derive(Parser, Debug)]
#[command(name = "stencil")]
#[command(version, about, long_about = None)]
#[command(allow_negative_numbers = true)]
struct Cli {
    /// Work-blocks per shard
    threads: i64,

    /// Number of iterations
    iterations: i64,

    /// Grid dimension n (the grid is n x n)
    dimension: i64,

    /// Shards per node
    #[arg(default_value_t = 1)]
    numa_nodes: i64,

    /// Stencil radius
    #[arg(long, env = "STENCIL_RADIUS", default_value_t = 2)]
    radius: i64,

    /// Number of nodes
    #[arg(long, env = "STENCIL_NODES", default_value_t = 1)]
    nodes: i64,

    /// Pin shard and work-block threads to cores
    #[arg(long)]
    pin: bool,

    /// Skip the validation pass
    #[arg(long)]
    timing_only: bool,

    /// Report latest end minus earliest start instead of the slowest shard
    #[arg(long)]
    wall_clock: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "spmd_stencil=info"
        } else {
            "spmd_stencil=warn"
        })
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_config(config: &StencilConfig) {
    println!("SPMD stencil execution on 2D grid");
    println!("Number of ranks        = {}", config.nodes);
    println!("Grid size              = {}", config.dimension);
    println!("Number of threads      = {}", config.threads);
    println!("Number of NUMA nodes   = {}", config.numa_nodes);
    println!("Radius of stencil      = {}", config.radius);
    println!("Data type              = double precision");
    println!("Number of iterations   = {}", config.iterations);
}

fn run(cli: Cli) -> Result<()> {
    let timing = if cli.wall_clock {
        TimingMode::WallClock
    } else {
        TimingMode::PerShard
    };
    let config = StencilConfig::new()
        .with_threads(cli.threads)
        .with_iterations(cli.iterations)
        .with_dimension(cli.dimension)
        .with_numa_nodes(cli.numa_nodes)
        .with_radius(cli.radius)
        .with_nodes(cli.nodes)
        .with_pinning(cli.pin)
        .with_timing_only(cli.timing_only)
        .with_timing(timing);

    config.check_counts()?;
    print_config(&config);

    let epoch = Epoch::new(config)?;
    let spec = epoch.spec();
    println!("Tiles in x/y-direction = {}/{}", spec.tiles_x(), spec.tiles_y());

    let report = epoch.run()?;
    report.verdict(EPSILON)?;
    match report.total_error {
        Some(error) => {
            println!("Solution validates");
            if cli.verbose {
                println!("Squared errors: {error:.6}");
            }
        }
        None => println!("Solution not validated (timing-only run)"),
    }
    println!("{report}");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e}");
            ExitCode::FAILURE
        }
    }
}
