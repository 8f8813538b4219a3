//! Stream checkpointing
//!
//! A checkpoint is the offset of the next record to consume for one
//! (source, partition). The `Checkpointer` only moves it past a record once
//! the sink and the engine have both finished with that record, and it never
//! moves backwards.
//!
//! When a record is dead-lettered after the sink gave up, the checkpoint is
//! held at that record's offset for the rest of the run: a restart replays it
//! (and everything after it, which is idempotent).

use super::error::CheckpointError;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Durable checkpoint storage keyed by (source, partition)
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, source: &str, partition: u32) -> Result<Option<u64>, CheckpointError>;

    async fn commit(&self, source: &str, partition: u32, next_offset: u64) -> Result<(), CheckpointError>;
}

/// Checkpoints in the `stream_checkpoints` table
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// Share an already-open connection (normally the appointment store's writer)
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let conn = Connection::open(db_path)?;
        super::db::apply_pragmas(&conn)?;
        super::db::run_schema_migrations(&conn)?;
        Ok(Self::new(Arc::new(Mutex::new(conn))))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, CheckpointError> {
        self.conn
            .lock()
            .map_err(|_| CheckpointError::Unavailable("connection mutex poisoned".to_string()))
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, source: &str, partition: u32) -> Result<Option<u64>, CheckpointError> {
        let conn = self.lock()?;
        let offset: Option<i64> = conn
            .query_row(
                "SELECT next_offset FROM stream_checkpoints WHERE source = ?1 AND partition = ?2",
                params![source, partition],
                |row| row.get(0),
            )
            .optional()?;
        Ok(offset.map(|o| o.max(0) as u64))
    }

    async fn commit(&self, source: &str, partition: u32, next_offset: u64) -> Result<(), CheckpointError> {
        let conn = self.lock()?;
        let offset = i64::try_from(next_offset)
            .map_err(|_| CheckpointError::Unavailable(format!("offset {} out of range", next_offset)))?;

        conn.execute(
            r#"
            INSERT INTO stream_checkpoints (source, partition, next_offset, committed_at_us)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(source, partition) DO UPDATE SET
                next_offset = excluded.next_offset,
                committed_at_us = excluded.committed_at_us
            "#,
            params![source, partition, offset, Utc::now().timestamp_micros()],
        )?;
        Ok(())
    }
}

/// In-memory checkpoint store; keeps every commit for inspection
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    offsets: Arc<Mutex<HashMap<(String, u32), u64>>>,
    history: Arc<Mutex<Vec<u64>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed offset, in commit order
    pub fn history(&self) -> Vec<u64> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, source: &str, partition: u32) -> Result<Option<u64>, CheckpointError> {
        let offsets = self
            .offsets
            .lock()
            .map_err(|_| CheckpointError::Unavailable("checkpoint map poisoned".to_string()))?;
        Ok(offsets.get(&(source.to_string(), partition)).copied())
    }

    async fn commit(&self, source: &str, partition: u32, next_offset: u64) -> Result<(), CheckpointError> {
        self.offsets
            .lock()
            .map_err(|_| CheckpointError::Unavailable("checkpoint map poisoned".to_string()))?
            .insert((source.to_string(), partition), next_offset);
        if let Ok(mut history) = self.history.lock() {
            history.push(next_offset);
        }
        Ok(())
    }
}

/// Tracks acknowledged progress for one partition and commits it
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
    source: String,
    partition: u32,
    /// Last offset written to the store
    committed: u64,
    /// Highest next-offset acknowledged by both sink and engine
    acked: u64,
    /// Set once a record could not be persisted
    held_at: Option<u64>,
    since_commit: u64,
    commit_every: u64,
}

impl Checkpointer {
    /// Load the committed offset (0 when the partition was never checkpointed)
    pub async fn resume(
        store: Arc<dyn CheckpointStore>,
        source: impl Into<String>,
        partition: u32,
        commit_every: u64,
    ) -> Result<Self, CheckpointError> {
        let source = source.into();
        let committed = store.load(&source, partition).await?.unwrap_or(0);

        log::info!("📍 Checkpoint for {}/{}: next offset {}", source, partition, committed);

        Ok(Self {
            store,
            source,
            partition,
            committed,
            acked: committed,
            held_at: None,
            since_commit: 0,
            commit_every: commit_every.max(1),
        })
    }

    /// Offset the source should seek to
    pub fn resume_offset(&self) -> u64 {
        self.committed
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn held_at(&self) -> Option<u64> {
        self.held_at
    }

    /// Record that everything before `next_offset` is done
    ///
    /// Returns true when enough records accumulated to warrant a commit.
    pub fn ack(&mut self, next_offset: u64) -> bool {
        if self.held_at.is_none() && next_offset > self.acked {
            self.acked = next_offset;
        }
        self.since_commit += 1;
        self.since_commit >= self.commit_every
    }

    /// Freeze the checkpoint at `offset` (a record the sink could not persist)
    pub fn hold(&mut self, offset: u64) {
        if self.held_at.is_none() {
            log::warn!(
                "⚠️  Checkpoint for {}/{} held at offset {}",
                self.source,
                self.partition,
                offset
            );
            self.held_at = Some(offset);
            self.acked = self.acked.min(offset);
        }
    }

    fn target(&self) -> u64 {
        match self.held_at {
            Some(held) => held.min(self.acked),
            None => self.acked,
        }
    }

    /// Persist acknowledged progress; returns the offset written, if any
    pub async fn commit(&mut self) -> Result<Option<u64>, CheckpointError> {
        self.since_commit = 0;
        let target = self.target();
        if target <= self.committed {
            return Ok(None);
        }

        self.store.commit(&self.source, self.partition, target).await?;
        self.committed = target;
        log::debug!("📍 Committed {}/{} at offset {}", self.source, self.partition, target);
        Ok(Some(target))
    }
}
