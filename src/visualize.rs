//! `visualize` subcommand (ambient stack, SPEC_FULL.md §6): load a run's
//! persisted Parquet back out and print a per-phase summary table. Full
//! plotting (the original's `visualizations/` package of matplotlib
//! dashboards) is out of scope here — this reads the same records and
//! reuses `metrics::phase_stats`, which is the part worth re-deriving in
//! Rust; rendering plots is not.

use crate::error::{BenchError, Result};
use crate::metrics::phase_stats;
use crate::record::RequestRecord;
use std::collections::BTreeMap;
use std::path::Path;

pub fn load_all_records(path: &Path) -> Result<Vec<RequestRecord>> {
    if path.is_dir() {
        let mut records = Vec::new();
        let entries = std::fs::read_dir(path).map_err(BenchError::Io)?;
        for entry in entries {
            let entry = entry.map_err(BenchError::Io)?;
            let file_path = entry.path();
            if file_path.extension().and_then(|e| e.to_str()) == Some("parquet") {
                records.extend(crate::record_store::load_records(&file_path)?);
            }
        }
        Ok(records)
    } else {
        crate::record_store::load_records(path)
    }
}

/// A readable per-phase table, one line per `phase_id`, in the order each
/// phase's requests started.
pub fn summarize(records: &[RequestRecord]) -> String {
    let mut phases: BTreeMap<String, f64> = BTreeMap::new();
    for r in records {
        let entry = phases.entry(r.phase_id.clone()).or_insert(r.start_ts);
        *entry = entry.min(r.start_ts);
    }
    let mut ordered: Vec<(String, f64)> = phases.into_iter().collect();
    ordered.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());

    let mut out = String::new();
    out.push_str(&format!(
        "{:<16} {:>6} {:>10} {:>9} {:>9} {:>9} {:>10}\n",
        "phase", "conc", "requests", "err_rate", "p50_ms", "p99_ms", "gbps"
    ));
    for (phase_id, _) in ordered {
        let phase_records: Vec<RequestRecord> = records
            .iter()
            .filter(|r| r.phase_id == phase_id)
            .cloned()
            .collect();
        let stats = phase_stats(&phase_id, &phase_records);
        out.push_str(&format!(
            "{:<16} {:>6} {:>10} {:>9.2} {:>9.1} {:>9.1} {:>10.3}\n",
            stats.phase_id,
            stats.concurrency,
            stats.total_requests,
            stats.error_rate,
            stats.p50_latency_ms,
            stats.p99_latency_ms,
            stats.throughput_gbps
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RequestStatus;

    fn record(phase_id: &str, start: f64, end: f64) -> RequestRecord {
        RequestRecord {
            shard_id: 0,
            worker_id: 0,
            object_key: "obj".into(),
            range_start: 0,
            range_len: 100,
            bytes_downloaded: 1000,
            status: RequestStatus::Ok,
            http_status: 200,
            latency_ms: 5.0,
            concurrency: 8,
            phase_id: phase_id.into(),
            start_ts: start,
            end_ts: end,
        }
    }

    #[test]
    fn summarize_orders_phases_by_start_time() {
        let records = vec![
            record("ramp_16", 200.0, 201.0),
            record("warm_up", 100.0, 101.0),
            record("ramp_8", 150.0, 151.0),
        ];
        let table = summarize(&records);
        let warm_pos = table.find("warm_up").unwrap();
        let ramp8_pos = table.find("ramp_8").unwrap();
        let ramp16_pos = table.find("ramp_16").unwrap();
        assert!(warm_pos < ramp8_pos);
        assert!(ramp8_pos < ramp16_pos);
    }
}
