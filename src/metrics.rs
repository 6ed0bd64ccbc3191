//! `MetricsAggregator` (spec §4.C): per-phase statistics with prorated
//! throughput, and per-window time-series prorating.
//!
//! The prorating algorithm and its exact semantics are grounded in
//! `R2-bench/visualizations/throughput_utils.py` (see
//! `examples/original_source/R2-bench/test/test_throughput_prorating.py`
//! for the literal numeric expectations reused as scenarios S5/S6 below).
//! Percentiles use sorted nearest-rank, matching
//! `R2-bench/persistence/metrics_aggregator.py`'s `sorted[int(len * p)]`.

use crate::record::RequestRecord;
use serde::Serialize;
use std::collections::HashMap;

const BITS_PER_BYTE: f64 = 8.0;
const GIGABIT: f64 = 1e9;

/// `(start, end)` of the interval a phase's records actually span, derived
/// at report time only (spec §3: `PhaseBoundaries`).
pub fn phase_boundaries(records: &[RequestRecord]) -> HashMap<String, (f64, f64)> {
    let mut bounds: HashMap<String, (f64, f64)> = HashMap::new();
    for r in records {
        let entry = bounds
            .entry(r.phase_id.clone())
            .or_insert((r.start_ts, r.end_ts));
        entry.0 = entry.0.min(r.start_ts);
        entry.1 = entry.1.max(r.end_ts);
    }
    bounds
}

/// Bytes `record` contributes to the interval `[window_start, window_end]`,
/// proportional to time overlap (spec §4.C). Zero duration requests
/// (start_ts == end_ts) are treated as instantaneous and attributed fully
/// to whichever window contains their timestamp.
pub fn prorated_bytes(record: &RequestRecord, window_start: f64, window_end: f64) -> f64 {
    let duration = record.duration_s();
    let overlap = record.overlap_s(window_start, window_end);
    if duration <= 0.0 {
        return if record.start_ts >= window_start && record.start_ts <= window_end {
            record.bytes_downloaded as f64
        } else {
            0.0
        };
    }
    record.bytes_downloaded as f64 * (overlap / duration)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseStats {
    pub phase_id: String,
    pub concurrency: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub error_requests: u64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub throughput_gbps: f64,
    pub duration_s: f64,
}

/// One row of the per-window time series (spec §4.C).
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub window_start: f64,
    pub window_end: f64,
    pub prorated_bytes: f64,
    pub throughput_gbps: f64,
}

fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }
    let idx = ((sorted_values.len() as f64) * p) as usize;
    let idx = idx.min(sorted_values.len() - 1);
    sorted_values[idx]
}

/// Compute statistics for `phase_id` using only the given records, which the
/// caller has already filtered to `start_ts >= measurement_started_ts`
/// (spec §4.D: "downstream steady-state stats only include records whose
/// start_ts >= this timestamp").
pub fn phase_stats(phase_id: &str, records: &[RequestRecord]) -> PhaseStats {
    let total_requests = records.len() as u64;

    if total_requests == 0 {
        // B2: zero successful requests -> zero throughput, error_rate = 1.0,
        // no division by zero.
        return PhaseStats {
            phase_id: phase_id.to_string(),
            concurrency: 0,
            total_requests: 0,
            successful_requests: 0,
            error_requests: 0,
            error_rate: 1.0,
            avg_latency_ms: 0.0,
            p50_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            p99_latency_ms: 0.0,
            throughput_gbps: 0.0,
            duration_s: 0.0,
        };
    }

    let successful: Vec<&RequestRecord> = records.iter().filter(|r| r.status.is_ok()).collect();
    let successful_requests = successful.len() as u64;
    let error_requests = total_requests - successful_requests;
    let error_rate = error_requests as f64 / total_requests as f64;

    let mut latencies: Vec<f64> = successful.iter().map(|r| r.latency_ms).collect();
    latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let avg_latency_ms = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };

    let bounds = phase_boundaries(records);
    let (phase_start, phase_end) = bounds
        .get(phase_id)
        .copied()
        .unwrap_or((0.0, 0.0));
    let duration_s = (phase_end - phase_start).max(0.0);

    let prorated_total: f64 = if duration_s > 0.0 {
        successful
            .iter()
            .map(|r| prorated_bytes(r, phase_start, phase_end))
            .sum()
    } else {
        0.0
    };

    let throughput_gbps = if duration_s > 0.0 {
        (prorated_total * BITS_PER_BYTE) / (duration_s * GIGABIT)
    } else {
        0.0
    };

    let concurrency = records.first().map(|r| r.concurrency).unwrap_or(0);

    PhaseStats {
        phase_id: phase_id.to_string(),
        concurrency,
        total_requests,
        successful_requests,
        error_requests,
        error_rate,
        avg_latency_ms,
        p50_latency_ms: percentile(&latencies, 0.50),
        p95_latency_ms: percentile(&latencies, 0.95),
        p99_latency_ms: percentile(&latencies, 0.99),
        throughput_gbps,
        duration_s,
    }
}

/// Per-window prorated throughput series (spec §4.C). Windows with no
/// overlapping requests emit no row.
pub fn window_series(records: &[RequestRecord], window_size_s: f64) -> Vec<WindowStats> {
    if records.is_empty() || window_size_s <= 0.0 {
        return Vec::new();
    }
    let min_start = records.iter().map(|r| r.start_ts).fold(f64::MAX, f64::min);
    let max_end = records.iter().map(|r| r.end_ts).fold(f64::MIN, f64::max);

    let mut windows = Vec::new();
    let mut t = min_start;
    while t < max_end {
        let window_end = t + window_size_s;
        let bytes: f64 = records
            .iter()
            .map(|r| prorated_bytes(r, t, window_end))
            .sum();
        if bytes > 0.0 {
            windows.push(WindowStats {
                window_start: t,
                window_end,
                prorated_bytes: bytes,
                throughput_gbps: (bytes * BITS_PER_BYTE) / (window_size_s * GIGABIT),
            });
        }
        t = window_end;
    }
    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RequestStatus;

    fn record(phase_id: &str, start: f64, end: f64, bytes: u64) -> RequestRecord {
        RequestRecord {
            shard_id: 0,
            worker_id: 0,
            object_key: "obj".into(),
            range_start: 0,
            range_len: 100,
            bytes_downloaded: bytes,
            status: RequestStatus::Ok,
            http_status: 200,
            latency_ms: 10.0,
            concurrency: 8,
            phase_id: phase_id.into(),
            start_ts: start,
            end_ts: end,
        }
    }

    #[test]
    fn phase_boundaries_min_start_max_end() {
        let records = vec![
            record("ramp_1", 100.0, 150.0, 1000),
            record("ramp_1", 105.0, 155.0, 2000),
            record("ramp_2", 200.0, 250.0, 3000),
            record("ramp_2", 205.0, 255.0, 4000),
        ];
        let bounds = phase_boundaries(&records);
        assert_eq!(bounds["ramp_1"], (100.0, 155.0));
        assert_eq!(bounds["ramp_2"], (200.0, 255.0));
    }

    // S5: prorating across two phases, 50/50 split.
    #[test]
    fn s5_prorating_across_two_phases() {
        let records = vec![record("ramp_1", 150.0, 250.0, 1000)];
        let bytes_p1 = prorated_bytes(&records[0], 100.0, 200.0);
        let bytes_p2 = prorated_bytes(&records[0], 200.0, 300.0);
        assert!((bytes_p1 - 500.0).abs() < 0.01);
        assert!((bytes_p2 - 500.0).abs() < 0.01);
    }

    // S6: prorating across three phases, 150/500/350 split.
    #[test]
    fn s6_prorating_across_three_phases() {
        let r = record("ramp_1", 170.0, 370.0, 1000);
        let p1 = prorated_bytes(&r, 100.0, 200.0);
        let p2 = prorated_bytes(&r, 200.0, 300.0);
        let p3 = prorated_bytes(&r, 300.0, 400.0);
        assert!((p1 - 150.0).abs() < 0.01);
        assert!((p2 - 500.0).abs() < 0.01);
        assert!((p3 - 350.0).abs() < 0.01);
        assert!(((p1 + p2 + p3) - 1000.0).abs() < 0.01);
    }

    #[test]
    fn prorating_single_phase_request_fully_inside() {
        let r = record("ramp_1", 100.0, 200.0, 1000);
        assert_eq!(prorated_bytes(&r, 100.0, 200.0), 1000.0);
    }

    // B2: zero successful requests -> zero throughput, error_rate 1.0, no
    // division by zero.
    #[test]
    fn b2_no_records_yields_zero_throughput_full_error_rate() {
        let stats = phase_stats("ramp_1", &[]);
        assert_eq!(stats.throughput_gbps, 0.0);
        assert_eq!(stats.error_rate, 1.0);
        assert_eq!(stats.total_requests, 0);
    }

    #[test]
    fn phase_stats_counts_errors() {
        let mut ok = record("ramp_1", 0.0, 1.0, 1000);
        let mut err = record("ramp_1", 1.0, 2.0, 0);
        err.status = RequestStatus::HttpNonSuccess;
        err.http_status = 503;
        ok.concurrency = 16;

        let stats = phase_stats("ramp_1", &[ok, err]);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.error_requests, 1);
        assert_eq!(stats.error_rate, 0.5);
        assert_eq!(stats.concurrency, 16);
    }

    #[test]
    fn window_series_empty_when_no_overlap() {
        let records = vec![record("ramp_1", 0.0, 1.0, 1000)];
        let windows = window_series(&records, 1.0);
        assert!(!windows.is_empty());
        assert!(windows.iter().all(|w| w.prorated_bytes > 0.0));
    }
}
