//! `capacity-bench` entry point: parses CLI args, resolves a `RuntimeConfig`
//! and a storage-backed `RangeGetter`, and dispatches to the requested
//! subcommand. Mirrors the teacher's thin-`anyhow`-over-typed-library-error
//! boundary: everything below `main` returns `capacity_bench::error::Result`,
//! and only this file deals in `anyhow`.

use anyhow::{Context, Result};
use capacity_bench::cli::{Cli, Command};
use capacity_bench::config::{ConfigOverrides, RuntimeConfig, StorageKind};
use capacity_bench::driver::CapacityDriver;
use capacity_bench::range_getter::{RangeGetter, SigV4RangeGetter};
use clap::Parser;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    capacity_bench::init::init_tracing(&cli.log_level, cli.json_logs);

    match cli.command {
        Command::Upload(args) => run_upload(args).await,
        Command::Check(args) => run_check(args).await,
        Command::Visualize(args) => run_visualize(args),
    }
}

async fn run_upload(args: capacity_bench::cli::UploadArgs) -> Result<()> {
    let storage = args.storage.0;
    let overrides = ConfigOverrides {
        object_key: args.object_key,
        size_gb: Some(args.size_gb),
        ..Default::default()
    };
    let config = resolve_config(storage, overrides)?;
    let getter = build_getter(storage, &config).await?;

    tracing::info!(
        object_key = %config.object_key,
        size_gb = config.object_size_gb,
        "uploading test object"
    );
    getter
        .put_object(&config.object_key, config.object_size_gb * 1_000_000_000)
        .await
        .context("failed to upload test object")?;
    println!("uploaded {} ({} GB)", config.object_key, config.object_size_gb);
    Ok(())
}

async fn run_check(args: capacity_bench::cli::CheckArgs) -> Result<()> {
    let storage = args.storage.0;
    let overrides = ConfigOverrides {
        object_key: args.object_key,
        bandwidth_gbps: args.bandwidth_gbps,
        processes: args.processes,
        workers: args.workers,
        ramp_step_workers: args.ramp_step_workers,
        ramp_step_minutes: args.ramp_step_minutes,
        pipeline_depth: args.pipeline_depth,
        max_workers: args.max_workers,
        size_gb: args.size_gb,
    };
    let config = resolve_config(storage, overrides)?;
    let getter = build_getter(storage, &config).await?;

    std::fs::create_dir_all(&args.results_dir).context("failed to create results directory")?;

    let json_summary = args.json_summary;
    let results_dir = args.results_dir.clone();
    let driver = CapacityDriver::new(config, getter, args.results_dir);
    let summary = driver.run().await.context("capacity check failed")?;

    if json_summary {
        let path = results_dir.join("summary.json");
        let body = serde_json::to_string_pretty(&summary).context("failed to encode summary as JSON")?;
        std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote JSON summary");
    }

    println!("warm-up:    {:.3} Gbps, error rate {:.2}%", summary.warm_up.throughput_gbps, summary.warm_up.error_rate * 100.0);
    for step in &summary.ramp {
        println!(
            "concurrency {:>4}: {:.3} Gbps, error rate {:.2}%",
            step.concurrency,
            step.stats.throughput_gbps,
            step.stats.error_rate * 100.0
        );
    }
    println!(
        "stopped: {} (peak {:.3} Gbps at concurrency {}, {} requests total)",
        summary.stop_reason, summary.peak_throughput_gbps, summary.peak_concurrency,
        summary.total_http_requests
    );
    Ok(())
}

fn run_visualize(args: capacity_bench::cli::VisualizeArgs) -> Result<()> {
    let records = capacity_bench::visualize::load_all_records(&args.parquet_file)
        .context("failed to load records")?;
    let table = capacity_bench::visualize::summarize(&records);
    print!("{table}");

    if let Some(output_dir) = args.output_dir {
        std::fs::create_dir_all(&output_dir).context("failed to create output directory")?;
        let path = output_dir.join("summary.txt");
        std::fs::write(&path, &table).with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote summary table");
    }
    Ok(())
}

/// Loads configuration from env vars layered with CLI overrides, then
/// validates it before any network traffic is issued.
fn resolve_config(storage: StorageKind, overrides: ConfigOverrides) -> Result<RuntimeConfig> {
    let config = capacity_bench::config::load(storage, overrides)?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn build_getter(storage: StorageKind, config: &RuntimeConfig) -> Result<Arc<dyn RangeGetter>> {
    let getter: Arc<dyn RangeGetter> = match storage {
        StorageKind::S3 => Arc::new(
            SigV4RangeGetter::s3(config)
                .await
                .context("failed to build S3 client")?,
        ),
        StorageKind::R2 => {
            let creds = config
                .r2
                .as_ref()
                .context("R2 credentials are required for --storage r2")?;
            Arc::new(SigV4RangeGetter::r2(config, creds).context("failed to build R2 client")?)
        }
    };
    Ok(getter)
}
