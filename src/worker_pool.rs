//! `WorkerPool` (spec §4.F): the per-shard fleet of concurrent range-GET
//! loops. A worker is a `tokio::task` repeatedly acquiring a gate permit,
//! issuing one request, and recording the outcome, until told to stop or
//! until it trips its own consecutive-error limit.
//!
//! Grounded in `R2-bench/common/worker_pool.py`'s async worker loop; the
//! "pipeline depth" knob is modeled here as `D` concurrently spawned tasks
//! sharing one logical worker id (spec §9's resolution of that open
//! question), each with its own independent consecutive-error counter so one
//! pipeline slot tripping its limit doesn't mask progress on the others.

use crate::error::BenchError;
use crate::gate::ResizableGate;
use crate::phase::PhaseManager;
use crate::range_getter::RangeGetter;
use crate::record::{RequestRecord, RequestStatus};
use crate::record_store::RecordStore;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ACQUIRE_POLL: Duration = Duration::from_millis(200);
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Everything a single worker task needs, shared with every other worker in
/// the same shard. Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct WorkerContext {
    pub shard_id: u32,
    pub object_key: String,
    pub object_size_bytes: u64,
    pub range_size_bytes: u64,
    pub max_retries: u32,
    pub max_consecutive_errors: u32,
    pub getter: Arc<dyn RangeGetter>,
    pub gate: Arc<ResizableGate>,
    pub phase: Arc<PhaseManager>,
    pub store: Arc<RecordStore>,
}

/// Runs the fleet of worker loops for one shard. `start` spawns tasks up to
/// `target_workers`; `stop` flips the shared stop flag and waits for every
/// task to exit so the caller can flush with no workers still appending.
///
/// Tasks are scheduled via an explicit `tokio::runtime::Handle` rather than
/// bare `tokio::spawn`, so a `ShardCoordinator` living on the main runtime
/// can still land worker tasks on a shard's own dedicated OS thread (spec
/// §9's thread-per-shard re-architecture).
pub struct WorkerPool {
    ctx: WorkerContext,
    runtime: tokio::runtime::Handle,
    stop: Arc<AtomicBool>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    next_worker_id: u32,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext, runtime: tokio::runtime::Handle) -> Self {
        Self {
            ctx,
            runtime,
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            next_worker_id: 0,
        }
    }

    /// Spawn `count` additional worker ids, each running `pipeline_depth`
    /// concurrent request loops (spec §9: total in-flight per shard is
    /// `workers * pipeline_depth`, bounded by the shard's gate).
    pub fn spawn(&mut self, count: u32, pipeline_depth: u32, phase_id: String) {
        for _ in 0..count {
            let worker_id = self.next_worker_id;
            self.next_worker_id += 1;
            for _ in 0..pipeline_depth.max(1) {
                let ctx = self.ctx.clone();
                let stop = self.stop.clone();
                let phase_id = phase_id.clone();
                let consecutive_errors = Arc::new(AtomicU32::new(0));
                self.handles.push(self.runtime.spawn(worker_loop(
                    ctx,
                    worker_id,
                    stop,
                    consecutive_errors,
                    phase_id,
                )));
            }
        }
    }

    pub fn active_worker_count(&self) -> u32 {
        self.next_worker_id
    }

    /// Signal every worker to exit and wait for them to drain. Each worker's
    /// gate permit is released on its own exit path (the `Permit`'s `Drop`),
    /// so this never leaves the gate over-subscribed.
    pub async fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// One worker id's request loop (spec §4.F):
/// 1. acquire a gate permit (bounded wait so the stop flag gets re-checked)
/// 2. snapshot the active phase
/// 3. pick a byte range
/// 4. issue the range-GET, retrying transport/non-2xx/timeout failures up to
///    `max_retries` times with a fixed delay between attempts
/// 5. build and append a `RequestRecord`
/// 6. update the phase manager's in-flight observation
/// 7. reset or increment the consecutive-error counter; exit if it trips
/// 8. release the permit (guaranteed via `Permit`'s `Drop`)
async fn worker_loop(
    ctx: WorkerContext,
    worker_id: u32,
    stop: Arc<AtomicBool>,
    consecutive_errors: Arc<AtomicU32>,
    phase_id: String,
) {
    while !stop.load(Ordering::SeqCst) {
        let Some(permit) = ctx.gate.acquire(ACQUIRE_POLL).await else {
            continue;
        };

        let phase = ctx.phase.snapshot();
        let (start, len) = pick_range(&ctx);
        let start_ts = crate::phase::now_ts();

        let outcome = issue_with_retry(&ctx, start, len).await;
        let end_ts = crate::phase::now_ts();

        let record = match &outcome {
            Ok(result) => RequestRecord {
                shard_id: ctx.shard_id,
                worker_id,
                object_key: ctx.object_key.clone(),
                range_start: start,
                range_len: len,
                bytes_downloaded: result.bytes.len() as u64,
                status: RequestStatus::Ok,
                http_status: result.http_status,
                latency_ms: result.latency_ms,
                concurrency: phase.target_concurrency,
                phase_id: phase_id.clone(),
                start_ts,
                end_ts,
            },
            Err(e) => {
                let (status, http_status) = classify(e);
                RequestRecord {
                    shard_id: ctx.shard_id,
                    worker_id,
                    object_key: ctx.object_key.clone(),
                    range_start: start,
                    range_len: len,
                    bytes_downloaded: 0,
                    status,
                    http_status,
                    latency_ms: (end_ts - start_ts) * 1000.0,
                    concurrency: phase.target_concurrency,
                    phase_id: phase_id.clone(),
                    start_ts,
                    end_ts,
                }
            }
        };
        ctx.store.append(record);

        ctx.phase.observe_in_flight(ctx.gate.in_flight().await);

        if outcome.is_ok() {
            consecutive_errors.store(0, Ordering::SeqCst);
        } else {
            let errors = consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
            if errors >= ctx.max_consecutive_errors {
                tracing::warn!(
                    worker_id,
                    shard_id = ctx.shard_id,
                    "worker hit consecutive-error limit ({}); exiting",
                    ctx.max_consecutive_errors
                );
                drop(permit);
                return;
            }
        }

        drop(permit);
    }
}

fn classify(err: &BenchError) -> (RequestStatus, u16) {
    match err {
        BenchError::HttpNonSuccess { status } => (RequestStatus::HttpNonSuccess, *status),
        BenchError::Timeout(_) => (RequestStatus::Timeout, 0),
        _ => (RequestStatus::Transport, 0),
    }
}

/// A uniformly random byte range within the object, aligned to
/// `range_size_bytes` (spec §4.F: "picks a byte range" — the original's
/// `random.randrange` equivalent, not a deterministic sweep, so concurrent
/// workers don't converge on the same offsets).
fn pick_range(ctx: &WorkerContext) -> (u64, u64) {
    let len = ctx.range_size_bytes.min(ctx.object_size_bytes.max(1));
    let max_start = ctx.object_size_bytes.saturating_sub(len);
    let start = if max_start == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=max_start)
    };
    (start, len)
}

async fn issue_with_retry(
    ctx: &WorkerContext,
    start: u64,
    len: u64,
) -> crate::error::Result<crate::range_getter::RangeResult> {
    let mut attempt = 0;
    loop {
        match ctx.getter.get_range(&ctx.object_key, start, len).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt > ctx.max_retries {
                    return Err(e);
                }
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }
}
