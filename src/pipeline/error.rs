//! Error taxonomy for the appointment pipeline
//!
//! Each stage owns its error type. The ingestion loop decides the policy:
//!
//! | Error            | Stream         | Offset              |
//! |------------------|----------------|---------------------|
//! | `DecodeError`    | continues      | advances            |
//! | `SinkError`      | continues      | frozen at the event |
//! | clamp (engine)   | continues      | advances            |
//! | `SourceError`    | retried        | does not move       |
//!
//! Aggregation invariant violations are not an error type at all: the engine
//! clamps and logs them (see `windows::Accumulator`).

use thiserror::Error;

/// Reasons a raw record is rejected by the decoder
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown {field} value `{value}`")]
    UnknownVariant { field: &'static str, value: String },

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("negative amount for `{field}`: {value}")]
    NegativeAmount { field: &'static str, value: f64 },

    #[error("copay {copay} exceeds cost {cost}")]
    CopayExceedsCost { cost: f64, copay: f64 },
}

/// Durable store failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Busy/locked store; worth retrying with backoff
    #[error("transient storage failure: {0}")]
    Transient(String),

    #[error("storage failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

impl From<rusqlite::Error> for SinkError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                SinkError::Transient(err.to_string())
            }
            _ => SinkError::Permanent(err.to_string()),
        }
    }
}

/// Event source failures
#[derive(Error, Debug)]
pub enum SourceError {
    /// Broker (or file) unreachable; the pipeline retries without moving the offset
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("dead-letter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dead-letter serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Top-level error for pipeline assembly and shutdown
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pipeline task failed: {0}")]
    Task(String),
}
