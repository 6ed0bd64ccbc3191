//! Error kinds (spec §7), as a `thiserror` enum. `anyhow` is reserved for
//! the outermost CLI boundary (teacher pattern: `otlp2parquet`'s thin
//! `anyhow` wrapper over a typed library error).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BenchError {
    /// Connection/socket/TLS failure while issuing a range-GET.
    #[error("transport error: {0}")]
    Transport(String),

    /// Response with a non-2xx status or an empty body.
    #[error("non-success response: status {status}")]
    HttpNonSuccess { status: u16 },

    /// Exceeded the request deadline.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A worker's consecutive-error counter reached the configured limit.
    #[error("worker {worker_id} hit the consecutive-error limit ({limit})")]
    ConsecutiveErrorLimit { worker_id: u32, limit: u32 },

    /// Phase-level error_rate exceeded the configured maximum.
    #[error("phase {phase_id} error rate {rate:.2} exceeds max_error_rate")]
    PhaseErrorRate { phase_id: String, rate: f64 },

    /// The test object does not exist and the uploader could not create one.
    #[error("object {0} does not exist and could not be created")]
    MissingObject(String),

    /// A shard died; detected on the coordinator's next liveness poll.
    #[error("shard {0} crashed")]
    ShardCrash(u32),

    /// Invalid or missing configuration (env vars, CLI flags).
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BenchError>;
