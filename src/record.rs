//! The immutable per-request observation that flows out of every worker.
//!
//! Mirrors the columnar schema in spec §6 field for field so a
//! `RequestRecord` round-trips through Arrow/Parquet without any
//! translation layer.

use serde::{Deserialize, Serialize};

/// Outcome of a single range-GET attempt.
///
/// `Ok` corresponds to HTTP 200; every other variant is `err{kind}` in the
/// spec's vocabulary (spec §3). The numeric `http_status` carried alongside
/// is what actually lands in the persisted column so `ok` vs non-`ok` stays
/// distinguishable by status code, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Ok,
    Transport,
    HttpNonSuccess,
    Timeout,
}

impl RequestStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RequestStatus::Ok)
    }

    /// The status code value persisted in the `http_status` column.
    /// Real non-2xx statuses are carried separately on the error path;
    /// transport/timeout failures that never got a response use the
    /// sentinel 0, matching `R2-bench`'s convention of a non-200 value.
    pub fn as_http_status(&self, observed: Option<u16>) -> u16 {
        match self {
            RequestStatus::Ok => 200,
            RequestStatus::HttpNonSuccess => observed.unwrap_or(0),
            RequestStatus::Transport | RequestStatus::Timeout => 0,
        }
    }
}

/// One immutable observation of a completed range-GET.
///
/// Invariants (spec §3): `phase_id` is snapshotted at `start_ts` and never
/// changes after the record is built; a `RequestRecord` is never mutated
/// after being appended to a `RecordStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub shard_id: u32,
    pub worker_id: u32,
    pub object_key: String,
    pub range_start: u64,
    pub range_len: u64,
    pub bytes_downloaded: u64,
    pub status: RequestStatus,
    pub http_status: u16,
    pub latency_ms: f64,
    pub concurrency: u32,
    pub phase_id: String,
    pub start_ts: f64,
    pub end_ts: f64,
}

impl RequestRecord {
    /// Duration of this request in seconds. Always `>= 0` per spec §3.
    pub fn duration_s(&self) -> f64 {
        (self.end_ts - self.start_ts).max(0.0)
    }

    /// The time-window overlap of this request with `[window_start, window_end]`,
    /// in seconds. Zero if the request does not overlap the window at all.
    pub fn overlap_s(&self, window_start: f64, window_end: f64) -> f64 {
        let start = self.start_ts.max(window_start);
        let end = self.end_ts.min(window_end);
        (end - start).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(start: f64, end: f64) -> RequestRecord {
        RequestRecord {
            shard_id: 0,
            worker_id: 0,
            object_key: "obj".into(),
            range_start: 0,
            range_len: 100,
            bytes_downloaded: 1000,
            status: RequestStatus::Ok,
            http_status: 200,
            latency_ms: 10.0,
            concurrency: 8,
            phase_id: "ramp_1".into(),
            start_ts: start,
            end_ts: end,
        }
    }

    #[test]
    fn duration_is_nonnegative() {
        let r = record(100.0, 200.0);
        assert_eq!(r.duration_s(), 100.0);
    }

    #[test]
    fn overlap_full_containment() {
        let r = record(150.0, 250.0);
        assert_eq!(r.overlap_s(100.0, 200.0), 50.0);
        assert_eq!(r.overlap_s(200.0, 300.0), 50.0);
    }

    #[test]
    fn overlap_disjoint_is_zero() {
        let r = record(100.0, 150.0);
        assert_eq!(r.overlap_s(200.0, 300.0), 0.0);
    }

    #[test]
    fn status_http_status_sentinels() {
        assert_eq!(RequestStatus::Ok.as_http_status(None), 200);
        assert_eq!(RequestStatus::Transport.as_http_status(None), 0);
        assert_eq!(RequestStatus::HttpNonSuccess.as_http_status(Some(503)), 503);
    }
}
