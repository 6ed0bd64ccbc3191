//! Unified runtime configuration (ambient stack, SPEC_FULL.md §6).
//!
//! Layering mirrors the teacher's `otlp2parquet-config`: built-in defaults,
//! then environment variables, then CLI flags (highest priority),
//! validated once before the `CapacityDriver` starts.

use crate::error::{BenchError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Storage backend selector (spec §9: "sum variant over {S3, R2}, both
/// satisfying the RangeGetter capability — no inheritance graph").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    S3,
    R2,
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::S3 => write!(f, "s3"),
            StorageKind::R2 => write!(f, "r2"),
        }
    }
}

impl FromStr for StorageKind {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "s3" | "aws" => Ok(StorageKind::S3),
            "r2" => Ok(StorageKind::R2),
            other => Err(BenchError::Config(format!(
                "unsupported storage backend '{other}'; supported: s3, r2"
            ))),
        }
    }
}

/// Defaults from spec §6 — must match bit-for-bit for comparable runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults;

impl Defaults {
    pub const OBJECT_SIZE_GB: u64 = 9;
    pub const RANGE_SIZE_MB: u64 = 100;
    pub const WARM_UP_MINUTES: u64 = 1;
    pub const INITIAL_CONCURRENCY: u32 = 8;
    pub const RAMP_STEP_MINUTES: u64 = 5;
    pub const RAMP_STEP_CONCURRENCY: u32 = 32;
    pub const MAX_CONCURRENCY: u32 = 400;
    pub const PLATEAU_THRESHOLD: f64 = 0.2;
    pub const MAX_ERROR_RATE: f64 = 0.2;
    pub const MAX_CONSECUTIVE_ERRORS: u32 = 20;
    pub const MAX_RETRIES: u32 = 3;
    pub const SYSTEM_BANDWIDTH_GBPS: f64 = 50.0;
    pub const PIPELINE_DEPTH: u32 = 3;
    pub const FLUSH_INTERVAL_SECS: u64 = 60;
    pub const PHASE_PUBLISH_POLL_SECS: u64 = 2;
    pub const PHASE_PROPAGATION_DELAY_SECS: u64 = 3;
    pub const RAMP_IN_DELAY_SECS: u64 = 2;
    pub const MIN_REQUESTS_FOR_ERROR_CHECK: u64 = 20;
    pub const DRAIN_TIMEOUT_SECS: u64 = 10;
    pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;
}

/// Static credentials for R2 (spec §6 env vars:
/// `R2_ACCESS_KEY_ID`/`R2_SECRET_ACCESS_KEY`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct R2Credentials {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: Option<String>,
}

/// The fully resolved configuration a `check` run operates under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub storage: StorageKind,
    pub bucket_name: String,
    pub object_key: String,
    pub region: String,
    pub s3_endpoint: Option<String>,
    pub r2: Option<R2Credentials>,

    pub object_size_gb: u64,
    pub range_size_mb: u64,
    pub warm_up_minutes: u64,
    pub initial_concurrency: u32,
    pub ramp_step_minutes: u64,
    pub ramp_step_concurrency: u32,
    pub max_concurrency: u32,
    pub plateau_threshold: f64,
    pub max_error_rate: f64,
    pub max_consecutive_errors: u32,
    pub max_retries: u32,
    pub system_bandwidth_gbps: f64,
    pub processes: u32,
    pub pipeline_depth: u32,
}

impl RuntimeConfig {
    /// Validate the configuration before any network traffic is issued.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_name.is_empty() {
            return Err(BenchError::Config("BUCKET_NAME is required".into()));
        }
        match self.storage {
            StorageKind::S3 => {
                if std::env::var("AWS_ACCESS_KEY_ID").is_err()
                    || std::env::var("AWS_SECRET_ACCESS_KEY").is_err()
                {
                    return Err(BenchError::Config(
                        "AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY are required for --storage s3"
                            .into(),
                    ));
                }
            }
            StorageKind::R2 => {
                if self.r2.is_none() {
                    return Err(BenchError::Config(
                        "R2_ACCOUNT_ID/R2_ACCESS_KEY_ID/R2_SECRET_ACCESS_KEY are required for --storage r2"
                            .into(),
                    ));
                }
            }
        }
        if self.max_concurrency < self.initial_concurrency {
            return Err(BenchError::Config(
                "max-workers must be >= the initial concurrency".into(),
            ));
        }
        Ok(())
    }

    pub fn total_requests(&self) -> u64 {
        self.processes as u64 * self.initial_concurrency as u64 * self.pipeline_depth as u64
    }
}

/// Reads the environment variables spec §6 names. Absence of a variable
/// required by the selected storage type is surfaced later by `validate`,
/// not here, so partial env setups still produce a readable error.
fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Everything the CLI's `check`/`upload` subcommands pass in, layered over
/// environment variables and built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub object_key: Option<String>,
    pub bandwidth_gbps: Option<f64>,
    pub processes: Option<u32>,
    pub workers: Option<u32>,
    pub ramp_step_workers: Option<u32>,
    pub ramp_step_minutes: Option<u64>,
    pub pipeline_depth: Option<u32>,
    pub max_workers: Option<u32>,
    pub size_gb: Option<u64>,
}

/// Lower-priority tunable overrides loaded from a TOML file, one rung below
/// CLI flags and above built-in defaults. Grounded in the teacher's
/// `otlp2parquet-config::sources::load_from_file` (a `CAPACITY_BENCH_CONFIG`-
/// pointed file here, in place of `OTLP2PARQUET_CONFIG`); every field is
/// optional, so a file only needs to name what it wants to override.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileOverrides {
    pub object_key: Option<String>,
    pub bandwidth_gbps: Option<f64>,
    pub processes: Option<u32>,
    pub workers: Option<u32>,
    pub ramp_step_workers: Option<u32>,
    pub ramp_step_minutes: Option<u64>,
    pub pipeline_depth: Option<u32>,
    pub max_workers: Option<u32>,
    pub size_gb: Option<u64>,
}

/// Reads `CAPACITY_BENCH_CONFIG`, if set, as a TOML file of `FileOverrides`.
/// Absent the variable, returns an all-`None` default — a config file is
/// optional, never required.
fn load_file_overrides() -> Result<FileOverrides> {
    let Some(path) = env_opt("CAPACITY_BENCH_CONFIG") else {
        return Ok(FileOverrides::default());
    };
    let text = std::fs::read_to_string(&path)
        .map_err(|e| BenchError::Config(format!("failed to read config file {path}: {e}")))?;
    toml::from_str(&text)
        .map_err(|e| BenchError::Config(format!("failed to parse config file {path}: {e}")))
}

pub fn load(storage: StorageKind, overrides: ConfigOverrides) -> Result<RuntimeConfig> {
    let file = load_file_overrides()?;

    let bucket_name = env_opt("BUCKET_NAME").unwrap_or_default();
    let object_key = overrides
        .object_key
        .clone()
        .or_else(|| file.object_key.clone())
        .or_else(|| env_opt("OBJECT_KEY"))
        .unwrap_or_else(|| "capacity-bench-object".to_string());

    let (region, s3_endpoint, r2) = match storage {
        StorageKind::S3 => (
            env_opt("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            env_opt("S3_ENDPOINT"),
            None,
        ),
        StorageKind::R2 => {
            let account_id = env_opt("R2_ACCOUNT_ID").unwrap_or_default();
            let r2 = if let (Some(ak), Some(sk)) =
                (env_opt("R2_ACCESS_KEY_ID"), env_opt("R2_SECRET_ACCESS_KEY"))
            {
                Some(R2Credentials {
                    account_id: account_id.clone(),
                    access_key_id: ak,
                    secret_access_key: sk,
                    endpoint: env_opt("R2_ENDPOINT"),
                })
            } else {
                None
            };
            ("auto".to_string(), None, r2)
        }
    };

    let config = RuntimeConfig {
        storage,
        bucket_name,
        object_key,
        region,
        s3_endpoint,
        r2,
        object_size_gb: overrides.size_gb.or(file.size_gb).unwrap_or(Defaults::OBJECT_SIZE_GB),
        range_size_mb: Defaults::RANGE_SIZE_MB,
        warm_up_minutes: Defaults::WARM_UP_MINUTES,
        initial_concurrency: overrides
            .workers
            .or(file.workers)
            .unwrap_or(Defaults::INITIAL_CONCURRENCY),
        ramp_step_minutes: overrides
            .ramp_step_minutes
            .or(file.ramp_step_minutes)
            .unwrap_or(Defaults::RAMP_STEP_MINUTES),
        ramp_step_concurrency: overrides
            .ramp_step_workers
            .or(file.ramp_step_workers)
            .unwrap_or(Defaults::RAMP_STEP_CONCURRENCY),
        max_concurrency: overrides
            .max_workers
            .or(file.max_workers)
            .unwrap_or(Defaults::MAX_CONCURRENCY),
        plateau_threshold: Defaults::PLATEAU_THRESHOLD,
        max_error_rate: Defaults::MAX_ERROR_RATE,
        max_consecutive_errors: Defaults::MAX_CONSECUTIVE_ERRORS,
        max_retries: Defaults::MAX_RETRIES,
        system_bandwidth_gbps: overrides
            .bandwidth_gbps
            .or(file.bandwidth_gbps)
            .unwrap_or(Defaults::SYSTEM_BANDWIDTH_GBPS),
        processes: overrides
            .processes
            .or(file.processes)
            .unwrap_or_else(|| num_cpus::get() as u32),
        pipeline_depth: overrides
            .pipeline_depth
            .or(file.pipeline_depth)
            .unwrap_or(Defaults::PIPELINE_DEPTH),
    };

    Ok(config)
}
