//! touch2sonata: converts touch files into per-column datasets.
//!
//! Usage:
//!   touch2sonata <INPUT> <OUTPUT> <POPULATION> [--layout v2] [--ranks 4]
//!
//! `INPUT` is a touch file or a directory of them. Datasets are written to
//! `OUTPUT/POPULATION/`. A binary named `*endian` byte-swaps its input.
//! Set `RUST_LOG` to adjust verbosity (default `info`).

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use touch2sonata::{ConvertConfig, LayoutVersion, Partition, pipeline};

#[derive(Parser, Debug)]
#[command(name = "touch2sonata")]
#[command(about = "Convert fixed-record touch files into per-column datasets")]
#[command(version)]
struct Args {
    /// Touch file, or directory of touch files
    input: PathBuf,

    /// Output directory
    output: PathBuf,

    /// Population name
    population: String,

    /// Record layout of the input (v1, v2 or v3)
    #[arg(long, default_value_t = LayoutVersion::V3)]
    layout: LayoutVersion,

    /// Byte-swap every record word on load
    #[arg(long)]
    endian_swap: bool,

    /// Number of cooperating ranks
    #[arg(short, long, default_value_t = 1)]
    ranks: usize,

    /// How input is split between ranks (files or records)
    #[arg(long, default_value_t = Partition::Files)]
    partition: Partition,

    /// Only write these columns
    #[arg(long, value_delimiter = ',', value_name = "NAME,...")]
    columns: Option<Vec<String>>,

    /// Batches buffered per column
    #[arg(long, default_value_t = 16)]
    queue_capacity: usize,

    /// Write the source/target indices (default)
    #[arg(long, overrides_with = "no_index")]
    index: bool,

    /// Skip writing the source/target indices
    #[arg(long, overrides_with = "index")]
    no_index: bool,

    /// Let every rank create its datasets independently
    #[arg(long)]
    independent_io: bool,
}

/// Whether the binary was invoked under an `*endian` name.
fn invoked_as_endian() -> bool {
    std::env::args_os()
        .next()
        .map(PathBuf::from)
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().ends_with("endian")))
        .unwrap_or(false)
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .try_init();

    let args = Args::parse();
    let config = ConvertConfig {
        layout: args.layout,
        endian_swap: args.endian_swap || invoked_as_endian(),
        partition: args.partition,
        population: args.population,
        columns: args.columns,
        queue_capacity: args.queue_capacity,
        create_index: args.index || !args.no_index,
        collective_io: !args.independent_io,
    };

    let inputs = match pipeline::list_inputs(&args.input) {
        Ok(inputs) => inputs,
        Err(e) => {
            error!(input = %args.input.display(), "{e}");
            return ExitCode::FAILURE;
        }
    };
    info!(files = inputs.len(), ranks = args.ranks, layout = %config.layout, "starting conversion");

    match pipeline::convert(&inputs, &args.output, &config, args.ranks) {
        Ok(reports) => {
            let total = reports.first().map_or(0, |r| r.plan.global_total);
            info!(records = total, output = %args.output.display(), "done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
