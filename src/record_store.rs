//! `RecordStore` (spec §4.B): a buffered, append-only sink of
//! `RequestRecord`s that periodically flushes to a columnar file.
//!
//! Grounded in `otlp2parquet-core::parquet::writer` (Arrow -> Parquet via
//! `ArrowWriter` with size-tuned `WriterProperties`) and
//! `otlp2parquet::writer::storage` (an `opendal::Operator` as the durable
//! sink, so the file format stays self-describing and loadable without the
//! running process).

use crate::error::{BenchError, Result};
use crate::record::{RequestRecord, RequestStatus};
use arrow::array::{Float64Array, RecordBatch, StringArray, UInt16Array, UInt32Array, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use once_cell::sync::OnceCell;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_dictionary_enabled(true)
        .set_statistics_enabled(EnabledStatistics::Page)
        .set_compression(Compression::SNAPPY)
        .build()
}

fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("ts", DataType::Float64, false),
        Field::new("thread_id", DataType::UInt32, false),
        Field::new("conn_id", DataType::UInt32, false),
        Field::new("object_key", DataType::Utf8, false),
        Field::new("range_start", DataType::UInt64, false),
        Field::new("range_len", DataType::UInt64, false),
        Field::new("bytes", DataType::UInt64, false),
        Field::new("latency_ms", DataType::Float64, false),
        Field::new("http_status", DataType::UInt16, false),
        Field::new("concurrency", DataType::UInt32, false),
        Field::new("phase_id", DataType::Utf8, false),
        Field::new("start_ts", DataType::Float64, false),
        Field::new("end_ts", DataType::Float64, false),
    ]))
}

fn records_to_batch(records: &[RequestRecord]) -> Result<RecordBatch> {
    let schema = schema();
    let ts = Float64Array::from(records.iter().map(|r| r.end_ts).collect::<Vec<_>>());
    let thread_id = UInt32Array::from(records.iter().map(|r| r.shard_id).collect::<Vec<_>>());
    let conn_id = UInt32Array::from(records.iter().map(|r| r.worker_id).collect::<Vec<_>>());
    let object_key =
        StringArray::from(records.iter().map(|r| r.object_key.as_str()).collect::<Vec<_>>());
    let range_start = UInt64Array::from(records.iter().map(|r| r.range_start).collect::<Vec<_>>());
    let range_len = UInt64Array::from(records.iter().map(|r| r.range_len).collect::<Vec<_>>());
    let bytes = UInt64Array::from(records.iter().map(|r| r.bytes_downloaded).collect::<Vec<_>>());
    let latency_ms = Float64Array::from(records.iter().map(|r| r.latency_ms).collect::<Vec<_>>());
    let http_status = UInt16Array::from(records.iter().map(|r| r.http_status).collect::<Vec<_>>());
    let concurrency = UInt32Array::from(records.iter().map(|r| r.concurrency).collect::<Vec<_>>());
    let phase_id =
        StringArray::from(records.iter().map(|r| r.phase_id.as_str()).collect::<Vec<_>>());
    let start_ts = Float64Array::from(records.iter().map(|r| r.start_ts).collect::<Vec<_>>());
    let end_ts = Float64Array::from(records.iter().map(|r| r.end_ts).collect::<Vec<_>>());

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ts),
            Arc::new(thread_id),
            Arc::new(conn_id),
            Arc::new(object_key),
            Arc::new(range_start),
            Arc::new(range_len),
            Arc::new(bytes),
            Arc::new(latency_ms),
            Arc::new(http_status),
            Arc::new(concurrency),
            Arc::new(phase_id),
            Arc::new(start_ts),
            Arc::new(end_ts),
        ],
    )
    .map_err(|e| BenchError::Config(format!("failed to build record batch: {e}")))
}

/// Encode records as Parquet bytes (self-describing, loadable standalone).
pub fn encode_parquet(records: &[RequestRecord]) -> Result<Vec<u8>> {
    let batch = records_to_batch(records)?;
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(writer_properties()))
        .map_err(|e| BenchError::Config(format!("failed to create parquet writer: {e}")))?;
    writer
        .write(&batch)
        .map_err(|e| BenchError::Config(format!("failed to write parquet batch: {e}")))?;
    writer
        .close()
        .map_err(|e| BenchError::Config(format!("failed to close parquet writer: {e}")))?;
    Ok(buffer)
}

/// Buffered, append-only sink of `RequestRecord`s for one shard.
///
/// `append` never blocks on IO; `flush` serialises the current batch and
/// empties the buffer. A flush failure is logged and the batch retained for
/// the next attempt, per spec §4.B's "records are never dropped silently".
pub struct RecordStore {
    shard_id: u32,
    results_dir: std::path::PathBuf,
    buffer: Mutex<Vec<RequestRecord>>,
    paths: Mutex<Vec<std::path::PathBuf>>,
    operator: OnceCell<opendal::Operator>,
    /// Monotonic per-store flush counter. Guarantees a unique file name even
    /// when two flushes (the periodic wall-clock one and the end-of-phase
    /// one, say) land in the same `chrono` tick — a seconds-resolution
    /// timestamp alone can't (spec R1: two flushes must produce two files,
    /// never one clobbering the other).
    flush_seq: AtomicU64,
}

impl RecordStore {
    pub fn new(shard_id: u32, results_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            shard_id,
            results_dir: results_dir.into(),
            buffer: Mutex::new(Vec::new()),
            paths: Mutex::new(Vec::new()),
            operator: OnceCell::new(),
            flush_seq: AtomicU64::new(0),
        }
    }

    pub fn append(&self, record: RequestRecord) {
        self.buffer.lock().expect("record buffer poisoned").push(record);
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().expect("record buffer poisoned").len()
    }

    /// Lazily builds (and reuses) the `opendal::Operator` rooted at
    /// `results_dir`, following the teacher's `otlp2parquet-writer::storage`
    /// pattern of a `once_cell`-cached operator instead of rebuilding one per
    /// write.
    fn operator(&self) -> Result<&opendal::Operator> {
        self.operator.get_or_try_init(|| {
            let builder = opendal::services::Fs::default().root(&self.results_dir.to_string_lossy());
            opendal::Operator::new(builder)
                .map(|b| b.finish())
                .map_err(|e| BenchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))
        })
    }

    /// Serialise the current batch to
    /// `results/benchmark_process{shard}_phase_{label}_{ts_nanos}_{seq}.parquet`
    /// (spec §6 naming, extended with a nanosecond timestamp and a monotonic
    /// sequence number) and empty the buffer. Returns `None` if there was
    /// nothing to flush. Safe to call on a wall-clock schedule as well as at
    /// phase end (spec §5: "flushed on a wall-clock interval and at phase
    /// end"); the sequence number guarantees each call's records land in
    /// their own file even when two flushes land in the same `chrono` tick,
    /// so periodic and end-of-phase flushes never clobber each other (R1).
    pub async fn flush(&self, label: &str) -> Result<Option<std::path::PathBuf>> {
        let batch: Vec<RequestRecord> = {
            let mut guard = self.buffer.lock().expect("record buffer poisoned");
            if guard.is_empty() {
                return Ok(None);
            }
            std::mem::take(&mut *guard)
        };

        let seq = self.flush_seq.fetch_add(1, Ordering::SeqCst);
        let file_name = format!(
            "benchmark_process{}_phase_{}_{}_{}.parquet",
            self.shard_id,
            label,
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            seq
        );
        let path = self.results_dir.join(&file_name);

        match encode_parquet(&batch) {
            Ok(bytes) => match self.write_file(&file_name, &bytes).await {
                Ok(()) => {
                    self.paths
                        .lock()
                        .expect("paths vec poisoned")
                        .push(path.clone());
                    Ok(Some(path))
                }
                Err(e) => {
                    tracing::error!("flush failed for shard {}: {e}; retaining batch", self.shard_id);
                    self.buffer.lock().expect("record buffer poisoned").extend(batch);
                    Err(e)
                }
            },
            Err(e) => {
                tracing::error!(
                    "parquet encoding failed for shard {}: {e}; retaining batch",
                    self.shard_id
                );
                self.buffer.lock().expect("record buffer poisoned").extend(batch);
                Err(e)
            }
        }
    }

    async fn write_file(&self, file_name: &str, bytes: &[u8]) -> Result<()> {
        let op = self.operator()?;
        op.write(file_name, bytes.to_vec())
            .await
            .map_err(|e| BenchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(())
    }

    /// Every file this store has flushed so far, across all phases.
    pub fn paths(&self) -> Vec<std::path::PathBuf> {
        self.paths.lock().expect("paths vec poisoned").clone()
    }

    /// The subset of `paths()` produced by a flush labelled `phase_id`
    /// (spec §4.G: `stats_for_phase` "loads all files tagged with that phase
    /// id"). Matches on the `_phase_{phase_id}_` naming segment so periodic
    /// mid-phase flushes and the end-of-phase flush are both picked up.
    pub fn paths_for_phase(&self, phase_id: &str) -> Vec<std::path::PathBuf> {
        let needle = format!("_phase_{phase_id}_");
        self.paths()
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(&needle))
            })
            .collect()
    }
}

/// Reads all records back out of a set of Parquet files (used by
/// `ShardCoordinator::stats_for_phase` and the `visualize` subcommand).
pub fn load_records(path: &std::path::Path) -> Result<Vec<RequestRecord>> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::File;

    let file = File::open(path).map_err(BenchError::Io)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| BenchError::Config(format!("failed to open parquet file: {e}")))?
        .build()
        .map_err(|e| BenchError::Config(format!("failed to build parquet reader: {e}")))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| BenchError::Config(format!("failed to read batch: {e}")))?;
        records.extend(batch_to_records(&batch)?);
    }
    Ok(records)
}

fn batch_to_records(batch: &RecordBatch) -> Result<Vec<RequestRecord>> {
    let col = |name: &str| -> Result<usize> {
        batch
            .schema()
            .index_of(name)
            .map_err(|e| BenchError::Config(format!("missing column {name}: {e}")))
    };

    let thread_id = batch
        .column(col("thread_id")?)
        .as_any()
        .downcast_ref::<UInt32Array>()
        .expect("thread_id column type");
    let conn_id = batch
        .column(col("conn_id")?)
        .as_any()
        .downcast_ref::<UInt32Array>()
        .expect("conn_id column type");
    let object_key = batch
        .column(col("object_key")?)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("object_key column type");
    let range_start = batch
        .column(col("range_start")?)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .expect("range_start column type");
    let range_len = batch
        .column(col("range_len")?)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .expect("range_len column type");
    let bytes = batch
        .column(col("bytes")?)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .expect("bytes column type");
    let latency_ms = batch
        .column(col("latency_ms")?)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("latency_ms column type");
    let http_status = batch
        .column(col("http_status")?)
        .as_any()
        .downcast_ref::<UInt16Array>()
        .expect("http_status column type");
    let concurrency = batch
        .column(col("concurrency")?)
        .as_any()
        .downcast_ref::<UInt32Array>()
        .expect("concurrency column type");
    let phase_id = batch
        .column(col("phase_id")?)
        .as_any()
        .downcast_ref::<StringArray>()
        .expect("phase_id column type");
    let start_ts = batch
        .column(col("start_ts")?)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("start_ts column type");
    let end_ts = batch
        .column(col("end_ts")?)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("end_ts column type");

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let status = match http_status.value(i) {
            200 => RequestStatus::Ok,
            0 => RequestStatus::Transport,
            _ => RequestStatus::HttpNonSuccess,
        };
        out.push(RequestRecord {
            shard_id: thread_id.value(i),
            worker_id: conn_id.value(i),
            object_key: object_key.value(i).to_string(),
            range_start: range_start.value(i),
            range_len: range_len.value(i),
            bytes_downloaded: bytes.value(i),
            status,
            http_status: http_status.value(i),
            latency_ms: latency_ms.value(i),
            concurrency: concurrency.value(i),
            phase_id: phase_id.value(i).to_string(),
            start_ts: start_ts.value(i),
            end_ts: end_ts.value(i),
        });
    }
    Ok(out)
}
