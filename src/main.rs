use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use gpusel::{GpuFilterSpec, GpuIdMap, GpuQuery, NvidiaSmi, Order, PsOwnerLookup};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpusel", version, about = "Inspect NVIDIA GPUs and pick idle ones")]
struct Cli {
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Path to the nvidia-smi binary
    #[arg(long, global = true, value_name = "PATH")]
    nvidia_smi: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show GPU utilization
    Show {
        /// Show every reported field
        #[arg(long)]
        all: bool,
    },
    /// List compute processes running on GPUs
    Processes,
    /// Print the ids of available GPUs
    Available {
        #[command(flatten)]
        filter: FilterArgs,

        /// Maximum number of ids to print
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Wait for an available GPU and print its id
    First {
        #[command(flatten)]
        filter: FilterArgs,

        /// Number of snapshots to take before giving up
        #[arg(long, default_value_t = 1)]
        attempts: u32,

        /// Seconds to wait between attempts
        #[arg(long, default_value_t = 900.0)]
        interval: f64,
    },
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// JSON file with filter settings; flags override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    order: Option<Order>,

    /// Loads below this fraction qualify
    #[arg(long)]
    max_load: Option<f64>,

    /// Memory utilizations below this fraction qualify
    #[arg(long)]
    max_memory: Option<f64>,

    /// Minimum free memory in MiB
    #[arg(long)]
    min_free_memory: Option<f64>,

    /// Treat unreported load or memory as available [true|false]
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    include_nan: Option<bool>,

    #[arg(long = "exclude-id", value_delimiter = ',')]
    exclude_ids: Vec<u32>,

    #[arg(long = "exclude-uuid", value_delimiter = ',')]
    exclude_uuids: Vec<String>,

    /// Compute modes to skip (replaces the default Exclusive_Process)
    #[arg(long = "exclude-compute-mode", value_delimiter = ',')]
    exclude_compute_modes: Vec<String>,
}

impl FilterArgs {
    fn resolve(&self, limit: Option<usize>) -> Result<GpuFilterSpec> {
        let mut spec = match &self.config {
            Some(path) => GpuFilterSpec::load(path)?,
            None => GpuFilterSpec::default(),
        };
        if let Some(order) = self.order {
            spec.order = order;
        }
        if let Some(limit) = limit {
            spec.limit = limit;
        }
        if let Some(max_load) = self.max_load {
            spec.max_load = max_load;
        }
        if let Some(max_memory) = self.max_memory {
            spec.max_memory_utilization = max_memory;
        }
        if let Some(min_free) = self.min_free_memory {
            spec.min_free_memory = min_free;
        }
        if let Some(include_nan) = self.include_nan {
            spec.include_nan = include_nan;
        }
        spec.exclude_ids.extend(self.exclude_ids.iter().copied());
        spec.exclude_uuids.extend(self.exclude_uuids.iter().cloned());
        if !self.exclude_compute_modes.is_empty() {
            spec.exclude_compute_modes = self.exclude_compute_modes.iter().cloned().collect();
        }
        spec.validate()?;
        debug!(?spec, "resolved filter");
        Ok(spec)
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_ids(ids: &[u32], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(ids)?);
    } else {
        let ids: Vec<String> = ids.iter().map(u32::to_string).collect();
        println!("{}", ids.join(","));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let smi = match &cli.nvidia_smi {
        Some(path) => NvidiaSmi::with_program(path),
        None => NvidiaSmi::new(),
    };

    match cli.command {
        Command::Show { all } => {
            let query =
                GpuQuery::with_id_map(Box::new(smi), Box::new(PsOwnerLookup), GpuIdMap::default());
            let gpus = query.gpu_snapshot();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&gpus)?);
            } else {
                print!("{}", gpusel::render_gpu_table(&gpus, all));
            }
        }
        Command::Processes => {
            let query = GpuQuery::new(Box::new(smi), Box::new(PsOwnerLookup));
            let processes = query.process_snapshot();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&processes)?);
            } else {
                print!("{}", gpusel::render_process_table(&processes));
            }
        }
        Command::Available { filter, limit } => {
            let spec = filter.resolve(limit)?;
            let query =
                GpuQuery::with_id_map(Box::new(smi), Box::new(PsOwnerLookup), GpuIdMap::default());
            print_ids(&query.select_available(&spec), cli.json)?;
        }
        Command::First {
            filter,
            attempts,
            interval,
        } => {
            let spec = filter.resolve(None)?;
            let interval = Duration::try_from_secs_f64(interval)
                .with_context(|| format!("invalid interval: {interval}"))?;
            let query =
                GpuQuery::with_id_map(Box::new(smi), Box::new(PsOwnerLookup), GpuIdMap::default());
            let ids = query.select_first_available(&spec, attempts, interval)?;
            print_ids(&ids, cli.json)?;
        }
    }

    Ok(())
}
