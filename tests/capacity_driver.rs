//! End-to-end exercise of the `CapacityDriver` state machine
//! (`Init -> EnsureObject -> Warmup -> Ramp -> Terminate`) against a
//! synthetic `RangeGetter`, plus a couple of cross-module invariants that
//! don't belong to any single unit.

use async_trait::async_trait;
use capacity_bench::config::{ConfigOverrides, StorageKind};
use capacity_bench::driver::CapacityDriver;
use capacity_bench::error::Result;
use capacity_bench::gate::ResizableGate;
use capacity_bench::metrics::phase_stats;
use capacity_bench::range_getter::{RangeGetter, RangeResult};
use capacity_bench::record::{RequestRecord, RequestStatus};
use capacity_bench::record_store::{load_records, RecordStore};
use std::sync::Arc;

/// A minimal `RangeGetter` double for exercising the driver end to end
/// without any real network traffic: every call succeeds immediately with
/// `bytes_per_request` bytes.
struct ConstantRangeGetter {
    bytes_per_request: u64,
}

#[async_trait]
impl RangeGetter for ConstantRangeGetter {
    async fn get_range(&self, _object_key: &str, _start: u64, length: u64) -> Result<RangeResult> {
        Ok(RangeResult {
            bytes: vec![0u8; self.bytes_per_request.min(length) as usize],
            latency_ms: 0.1,
            http_status: 200,
        })
    }

    async fn object_exists(&self, _object_key: &str) -> Result<bool> {
        Ok(true)
    }

    async fn put_object(&self, _object_key: &str, _size_bytes: u64) -> Result<()> {
        Ok(())
    }
}

fn unique_dir(label: &str) -> std::path::PathBuf {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("capacity-bench-{label}-{ts}"))
}

fn base_config(overrides: ConfigOverrides) -> capacity_bench::config::RuntimeConfig {
    std::env::set_var("BUCKET_NAME", "integration-test-bucket");
    std::env::set_var("AWS_ACCESS_KEY_ID", "ak");
    std::env::set_var("AWS_SECRET_ACCESS_KEY", "sk");
    let mut cfg = capacity_bench::config::load(StorageKind::S3, overrides).unwrap();
    cfg.warm_up_minutes = 0;
    cfg.ramp_step_minutes = 0;
    cfg
}

#[tokio::test]
async fn driver_runs_warmup_then_ramp_and_stops_at_max_concurrency() {
    let dir = unique_dir("e2e-maxconc");
    std::fs::create_dir_all(&dir).unwrap();

    let mut overrides = ConfigOverrides::default();
    overrides.processes = Some(1);
    overrides.workers = Some(2);
    overrides.ramp_step_workers = Some(2);
    overrides.max_workers = Some(4);
    overrides.size_gb = Some(1);
    let config = base_config(overrides);

    let getter: Arc<dyn RangeGetter> = Arc::new(ConstantRangeGetter {
        bytes_per_request: 1_000_000,
    });
    let driver = CapacityDriver::new(config, getter, dir.clone());

    let summary = driver.run().await.expect("driver run should succeed");

    assert!(summary.warm_up.total_requests > 0);
    assert!(!summary.ramp.is_empty());
    assert!(summary.ramp.last().unwrap().concurrency <= 4);
    assert_eq!(summary.stop_reason, "reached max_concurrency");
    assert!(summary.total_http_requests >= summary.warm_up.total_requests);

    let _ = std::fs::remove_dir_all(&dir);
}

// R2: aggregate stats derived from reloading persisted files don't depend
// on the order those files happen to be read back in.
#[tokio::test]
async fn phase_stats_is_order_independent_across_reloaded_files() {
    let dir = unique_dir("r2-order");
    std::fs::create_dir_all(&dir).unwrap();
    let store = RecordStore::new(0, &dir);

    for i in 0..5 {
        store.append(RequestRecord {
            shard_id: 0,
            worker_id: i,
            object_key: "obj".into(),
            range_start: 0,
            range_len: 1000,
            bytes_downloaded: 1000,
            status: RequestStatus::Ok,
            http_status: 200,
            latency_ms: 10.0 + i as f64,
            concurrency: 8,
            phase_id: "ramp_8".into(),
            start_ts: i as f64,
            end_ts: i as f64 + 1.0,
        });
    }
    let path_a = store.flush("ramp_8").await.unwrap().unwrap();

    for i in 5..8 {
        store.append(RequestRecord {
            shard_id: 0,
            worker_id: i,
            object_key: "obj".into(),
            range_start: 0,
            range_len: 1000,
            bytes_downloaded: 1000,
            status: RequestStatus::Ok,
            http_status: 200,
            latency_ms: 10.0 + i as f64,
            concurrency: 8,
            phase_id: "ramp_8".into(),
            start_ts: i as f64,
            end_ts: i as f64 + 1.0,
        });
    }
    let path_b = store.flush("ramp_8").await.unwrap().unwrap();

    let mut forward = load_records(&path_a).unwrap();
    forward.extend(load_records(&path_b).unwrap());
    let stats_forward = phase_stats("ramp_8", &forward);

    let mut backward = load_records(&path_b).unwrap();
    backward.extend(load_records(&path_a).unwrap());
    let stats_backward = phase_stats("ramp_8", &backward);

    assert_eq!(stats_forward.total_requests, stats_backward.total_requests);
    assert!((stats_forward.throughput_gbps - stats_backward.throughput_gbps).abs() < 1e-9);
    assert_eq!(stats_forward.avg_latency_ms, stats_backward.avg_latency_ms);

    let _ = std::fs::remove_dir_all(&dir);
}

// B1: resizing a gate up and then back down by the same amount restores the
// original ceiling exactly.
#[tokio::test]
async fn gate_resize_up_then_down_restores_original_ceiling() {
    let gate = ResizableGate::new(8);
    gate.resize(20).await;
    gate.resize(8).await;
    assert_eq!(gate.max().await, 8);
    assert_eq!(gate.available().await, 8);
}

// I1: duration_s is never negative even if a record's timestamps are
// equal or (degenerately) reversed by clock skew.
#[test]
fn duration_invariant_never_negative() {
    let r = RequestRecord {
        shard_id: 0,
        worker_id: 0,
        object_key: "obj".into(),
        range_start: 0,
        range_len: 100,
        bytes_downloaded: 100,
        status: RequestStatus::Ok,
        http_status: 200,
        latency_ms: 1.0,
        concurrency: 1,
        phase_id: "ramp_1".into(),
        start_ts: 100.0,
        end_ts: 99.0,
    };
    assert_eq!(r.duration_s(), 0.0);
}
