//! `CapacityDriver` (spec §4.I): the top-level state machine a `check` run
//! executes — `Init -> EnsureObject -> Warmup -> Ramp -> Terminate`.
//!
//! Grounded in the overall shape of `R2-bench/cli/benchmark.py`'s driver
//! loop: ensure the test object exists, run a fixed warm-up at the initial
//! concurrency to prime connections, then step concurrency upward on a
//! timer, feeding each step's prorated throughput into a `PlateauDetector`
//! until it says to stop.

use crate::config::{Defaults, RuntimeConfig};
use crate::error::{BenchError, Result};
use crate::metrics::PhaseStats;
use crate::plateau::PlateauDetector;
use crate::range_getter::RangeGetter;
use crate::shard::ShardCoordinator;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const BYTES_PER_GB: u64 = 1_000_000_000;

/// One step of the ramp, with the concurrency reached and the stats
/// measured at that concurrency (spec §4.I).
#[derive(Debug, Clone, Serialize)]
pub struct RampStep {
    pub concurrency: u32,
    pub stats: PhaseStats,
}

/// The full result of a `check` run (spec §6's terminal summary object).
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub warm_up: PhaseStats,
    pub ramp: Vec<RampStep>,
    pub stop_reason: String,
    pub peak_throughput_gbps: f64,
    pub peak_concurrency: u32,
    /// `S * W * D` across the whole run (spec §9): every request any shard
    /// issued, summed across the warm-up and every ramp step.
    pub total_http_requests: u64,
}

/// Orchestrates one end-to-end capacity run against a single object.
pub struct CapacityDriver {
    config: RuntimeConfig,
    getter: Arc<dyn RangeGetter>,
    results_dir: PathBuf,
}

impl CapacityDriver {
    pub fn new(config: RuntimeConfig, getter: Arc<dyn RangeGetter>, results_dir: PathBuf) -> Self {
        Self {
            config,
            getter,
            results_dir,
        }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;
        self.ensure_object().await?;

        let object_size_bytes = self.config.object_size_gb * BYTES_PER_GB;
        let range_size_bytes = self.config.range_size_mb * 1_000_000;

        let coordinator = ShardCoordinator::spawn(
            self.config.processes,
            self.results_dir.clone(),
            self.getter.clone(),
            self.config.object_key.clone(),
            object_size_bytes,
            range_size_bytes,
            self.config.max_retries,
            self.config.max_consecutive_errors,
        );

        // Run warm-up then ramp, but make sure the coordinator is shut down
        // (flushing whatever each shard still has buffered) on every path,
        // including a `shard_crash` abort — spec §7: "partial results
        // remain usable" even when the benchmark terminates early.
        let outcome = async {
            let warm_up = self.run_warmup(&coordinator).await?;
            let (ramp, stop_reason) = self.run_ramp(&coordinator).await?;
            Ok((warm_up, ramp, stop_reason))
        }
        .await;

        coordinator.shutdown().await;

        let (warm_up, ramp, stop_reason) = outcome?;

        let peak = ramp
            .iter()
            .map(|s| (s.stats.throughput_gbps, s.concurrency))
            .fold((warm_up.throughput_gbps, self.config.initial_concurrency), |best, cur| {
                if cur.0 > best.0 {
                    cur
                } else {
                    best
                }
            });

        let total_http_requests =
            warm_up.total_requests + ramp.iter().map(|s| s.stats.total_requests).sum::<u64>();

        Ok(RunSummary {
            warm_up,
            ramp,
            stop_reason,
            peak_throughput_gbps: peak.0,
            peak_concurrency: peak.1,
            total_http_requests,
        })
    }

    /// `EnsureObject`: verify the benchmark object exists, uploading a
    /// zero-filled replacement of the configured size if it doesn't (spec
    /// §4.I: "a run never starts without a confirmed target object").
    async fn ensure_object(&self) -> Result<()> {
        if self.getter.object_exists(&self.config.object_key).await? {
            return Ok(());
        }
        tracing::info!(
            object_key = %self.config.object_key,
            "test object not found, uploading {} GB",
            self.config.object_size_gb
        );
        let size_bytes = self.config.object_size_gb * BYTES_PER_GB;
        self.getter
            .put_object(&self.config.object_key, size_bytes)
            .await
            .map_err(|_| BenchError::MissingObject(self.config.object_key.clone()))
    }

    /// `Warmup`: run at `initial_concurrency` for `warm_up_minutes`,
    /// discarding nothing — the phase's own records already exclude the
    /// ramp-in transient via `measurement_started_ts` (spec §4.D).
    async fn run_warmup(&self, coordinator: &ShardCoordinator) -> Result<PhaseStats> {
        let duration = Duration::from_secs(self.config.warm_up_minutes * 60);
        let stats = coordinator
            .run_phase(
                "warm_up",
                self.config.initial_concurrency,
                self.config.pipeline_depth,
                duration,
            )
            .await?;
        tracing::info!(
            throughput_gbps = stats.throughput_gbps,
            error_rate = stats.error_rate,
            "warm-up complete"
        );
        Ok(stats)
    }

    /// `Ramp`: step concurrency upward every `ramp_step_minutes`, stopping
    /// when the `PlateauDetector` says to, the error rate is too high, or
    /// `max_concurrency` is reached (spec §4.I/§4.H).
    async fn run_ramp(&self, coordinator: &ShardCoordinator) -> Result<(Vec<RampStep>, String)> {
        let mut detector = PlateauDetector::new(
            self.config.plateau_threshold,
            Some(self.config.system_bandwidth_gbps),
        );
        let step_duration = Duration::from_secs(self.config.ramp_step_minutes * 60);
        let mut concurrency = self.config.initial_concurrency;
        let mut steps = Vec::new();

        loop {
            let phase_id = format!("ramp_{concurrency}");
            let stats = coordinator
                .run_phase(&phase_id, concurrency, self.config.pipeline_depth, step_duration)
                .await?;

            if stats.total_requests >= Defaults::MIN_REQUESTS_FOR_ERROR_CHECK
                && stats.error_rate > self.config.max_error_rate
            {
                let reason = format!(
                    "phase {phase_id} error rate {:.2} exceeds max_error_rate {:.2}",
                    stats.error_rate, self.config.max_error_rate
                );
                steps.push(RampStep { concurrency, stats });
                return Ok((steps, reason));
            }

            detector.add(concurrency, stats.throughput_gbps, stats.duration_s);
            steps.push(RampStep { concurrency, stats });

            let verdict = detector.is_plateau();
            if verdict.stop {
                return Ok((steps, verdict.reason));
            }

            if concurrency >= self.config.max_concurrency {
                return Ok((steps, "reached max_concurrency".to_string()));
            }

            concurrency = (concurrency + self.config.ramp_step_concurrency)
                .min(self.config.max_concurrency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, StorageKind};
    use crate::range_getter::fake::FakeRangeGetter;

    fn test_config(overrides: ConfigOverrides) -> RuntimeConfig {
        std::env::set_var("BUCKET_NAME", "test-bucket");
        std::env::set_var("AWS_ACCESS_KEY_ID", "ak");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "sk");
        let mut cfg = crate::config::load(StorageKind::S3, overrides).unwrap();
        cfg.warm_up_minutes = 0;
        cfg.ramp_step_minutes = 0;
        cfg
    }

    #[tokio::test]
    async fn full_run_reaches_terminate_and_produces_a_summary() {
        let dir = std::env::temp_dir().join(format!("drivertest-{}", crate::phase::now_ts() as u64));
        std::fs::create_dir_all(&dir).unwrap();

        let mut overrides = ConfigOverrides::default();
        overrides.processes = Some(1);
        overrides.workers = Some(2);
        overrides.ramp_step_workers = Some(2);
        overrides.max_workers = Some(4);
        overrides.size_gb = Some(1);
        let config = test_config(overrides);

        let getter: Arc<dyn RangeGetter> = Arc::new(FakeRangeGetter::constant(1_000_000, 0.1));
        let driver = CapacityDriver::new(config, getter, dir.clone());

        let summary = driver.run().await.unwrap();
        assert!(!summary.ramp.is_empty());
        assert!(summary.peak_throughput_gbps >= 0.0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn ensure_object_uploads_when_missing() {
        let dir = std::env::temp_dir().join(format!("drivertest2-{}", crate::phase::now_ts() as u64));
        std::fs::create_dir_all(&dir).unwrap();

        let mut overrides = ConfigOverrides::default();
        overrides.processes = Some(1);
        overrides.workers = Some(1);
        overrides.max_workers = Some(1);
        overrides.size_gb = Some(1);
        let config = test_config(overrides);

        let getter: Arc<dyn RangeGetter> =
            Arc::new(FakeRangeGetter::with_steps(
                vec![crate::range_getter::fake::Step::Ok {
                    bytes: 1000,
                    latency_ms: 0.1,
                }],
                false,
            ));
        let driver = CapacityDriver::new(config, getter, dir.clone());
        // object_exists() is false, so run() must go through put_object
        // before anything else; FakeRangeGetter::put_object always succeeds.
        let result = driver.run().await;
        assert!(result.is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
