//! # Appointment Ingestion-to-Aggregation Pipeline
//!
//! Consumes an append-only stream of appointment events, persists each
//! appointment idempotently and keeps live aggregates without re-scanning
//! history on reads.
//!
//! ## Architecture
//!
//! ```text
//! EventSource (JSONL file / memory)
//!     ↓ reader task, mpsc channel
//! decoder::decode ──(reject)──► DeadLetterSink
//!     ↓
//!     ├─► AppointmentStore::upsert   (SQLite, versioned UPSERT, retry/backoff)
//!     └─► AggregationEngine::apply   (cumulative + per-minute buckets)
//!     ↓ join
//! Checkpointer (stream_checkpoints)
//!
//! QueryFacade ──read lock──► AggregationEngine
//!             ──reader conn─► AppointmentStore
//! ```
//!
//! The store is the source of truth for raw records. The engine is a derived
//! cache, rebuilt from `scan_all()` on start.
//!
//! ## Module Organization
//!
//! - `types` - AppointmentEvent, enums, stream positions
//! - `source` - EventSource trait, JSONL and memory sources
//! - `decoder` - raw bytes to validated AppointmentEvent
//! - `db` - AppointmentStore trait and SQLite implementation
//! - `dead_letter` - rejected/unpersistable records
//! - `retry` - exponential backoff
//! - `windows`, `state`, `engine` - incremental aggregation
//! - `checkpoint` - committed stream offsets
//! - `ingestion` - the pipeline loop and graceful shutdown
//! - `stats` - counters and health
//! - `query` - read-only facade
//! - `config` - environment configuration
//! - `error` - error taxonomy

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod dead_letter;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod query;
pub mod retry;
pub mod source;
pub mod state;
pub mod stats;
pub mod types;
pub mod windows;

// Re-export commonly used types
pub use checkpoint::{CheckpointStore, Checkpointer, MemoryCheckpointStore, SqliteCheckpointStore};
pub use config::PipelineConfig;
pub use db::{AppointmentStore, SqliteAppointmentStore, UpsertOutcome};
pub use dead_letter::{DeadLetter, DeadLetterKind, DeadLetterSink, JsonlDeadLetterWriter, MemoryDeadLetterSink};
pub use decoder::decode;
pub use engine::{AggregationEngine, ApplyOutcome, EngineConfig};
pub use error::{DecodeError, PipelineError, SinkError, SourceError};
pub use ingestion::{rebuild_engine, Pipeline, PipelineHandle, PipelineReport};
pub use query::{QueryFacade, SharedEngine};
pub use source::{EventSource, JsonlFileSource, MemorySource};
pub use state::Kpis;
pub use stats::{PipelineHealth, PipelineStats};
pub use types::{AppointmentEvent, AppointmentStatus, PaymentMethod, PersistedRecord, StreamPosition, Urgency};
pub use windows::{AggregateWindow, TimeRange, WindowMetric};
