//! Command-line surface (ambient stack, SPEC_FULL.md §6). Grounded in the
//! `w1r3` object-storage benchmark's `clap::Parser` derive style: doc
//! comments double as `--help` text, defaults come from `Defaults`.

use crate::config::StorageKind;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "capacity-bench",
    about = "Discovers the practical throughput ceiling of an S3-compatible bucket",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit structured JSON logs instead of human-readable text.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Log verbosity; overridden by `RUST_LOG` if set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload a zero-filled test object of the configured size.
    Upload(UploadArgs),

    /// Run the ramp-and-plateau capacity check against a test object.
    Check(CheckArgs),

    /// Summarize a previously recorded run from its Parquet output.
    Visualize(VisualizeArgs),
}

#[derive(Parser, Debug)]
pub struct UploadArgs {
    /// Which backend to target.
    #[arg(long)]
    pub storage: StorageKindArg,

    /// Object size in gigabytes.
    #[arg(long, default_value_t = crate::config::Defaults::OBJECT_SIZE_GB)]
    pub size_gb: u64,

    /// Object key to create. Defaults to the benchmark's own key.
    #[arg(long)]
    pub object_key: Option<String>,
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Which backend to target.
    #[arg(long)]
    pub storage: StorageKindArg,

    /// Object key to range-GET against.
    #[arg(long)]
    pub object_key: Option<String>,

    /// Assumed hard ceiling for the link, in Gbps; the ramp stops once
    /// measured throughput reaches it.
    #[arg(long)]
    pub bandwidth_gbps: Option<f64>,

    /// Number of shard processes (OS threads, one tokio runtime each).
    /// Defaults to the number of logical CPUs.
    #[arg(long)]
    pub processes: Option<u32>,

    /// Initial total concurrency across all shards.
    #[arg(long)]
    pub workers: Option<u32>,

    /// How much to grow total concurrency by on each ramp step.
    #[arg(long)]
    pub ramp_step_workers: Option<u32>,

    /// Minutes to hold each ramp step before measuring it.
    #[arg(long)]
    pub ramp_step_minutes: Option<u64>,

    /// Concurrent in-flight requests per logical worker id.
    #[arg(long)]
    pub pipeline_depth: Option<u32>,

    /// Hard ceiling on total concurrency the ramp will ever reach.
    #[arg(long)]
    pub max_workers: Option<u32>,

    /// Object size in gigabytes, used only if the object needs creating.
    #[arg(long)]
    pub size_gb: Option<u64>,

    /// Directory Parquet output files are written to.
    #[arg(long, default_value = "results")]
    pub results_dir: std::path::PathBuf,

    /// Also write the terminal summary as `summary.json` inside
    /// `results_dir`, alongside the Parquet output.
    #[arg(long)]
    pub json_summary: bool,
}

#[derive(Parser, Debug)]
pub struct VisualizeArgs {
    /// Parquet file (or directory of them) produced by a `check` run.
    #[arg(long)]
    pub parquet_file: std::path::PathBuf,

    /// Also write the summary table to `summary.txt` in this directory,
    /// in addition to printing it.
    #[arg(long)]
    pub output_dir: Option<std::path::PathBuf>,
}

/// `clap`'s derive macro picks up any `FromStr` type automatically; this
/// thin newtype over `StorageKind` keeps that `FromStr` impl in
/// `config.rs` as the single source of truth instead of duplicating it.
#[derive(Debug, Clone, Copy)]
pub struct StorageKindArg(pub StorageKind);

impl std::str::FromStr for StorageKindArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<StorageKind>()
            .map(StorageKindArg)
            .map_err(|e| e.to_string())
    }
}
