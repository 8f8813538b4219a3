//! Durable appointment store (the Sink)
//!
//! Tables (see `SCHEMA`):
//! - `appointments` - UPSERT on appointment_id, guarded by version
//! - `stream_checkpoints` - committed source offsets (see `checkpoint`)
//!
//! The store is the single source of truth for raw records. Aggregates are
//! rebuilt from `scan_all()` when needed.

use super::error::SinkError;
use super::types::{AppointmentEvent, AppointmentStatus, PaymentMethod, PersistedRecord, Urgency};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Embedded schema, executed in order on open; every statement is idempotent
pub const SCHEMA: &[(&str, &str)] = &[
    (
        "01_appointments",
        r#"
        CREATE TABLE IF NOT EXISTS appointments (
            appointment_id  TEXT PRIMARY KEY,
            version         INTEGER NOT NULL,
            status          TEXT NOT NULL,
            department      TEXT NOT NULL,
            urgency         TEXT NOT NULL,
            cost_cents      INTEGER NOT NULL,
            copay_cents     INTEGER NOT NULL,
            timestamp_us    INTEGER NOT NULL,
            city            TEXT NOT NULL,
            payment_method  TEXT NOT NULL,
            inserted_at_us  INTEGER NOT NULL,
            updated_at_us   INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_appointments_timestamp
            ON appointments(timestamp_us DESC);
        CREATE INDEX IF NOT EXISTS idx_appointments_status_timestamp
            ON appointments(status, timestamp_us DESC);
        "#,
    ),
    (
        "02_stream_checkpoints",
        r#"
        CREATE TABLE IF NOT EXISTS stream_checkpoints (
            source          TEXT NOT NULL,
            partition       INTEGER NOT NULL,
            next_offset     INTEGER NOT NULL,
            committed_at_us INTEGER NOT NULL,
            PRIMARY KEY (source, partition)
        );
        "#,
    ),
];

/// Result of an idempotent upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Existing record had an equal or lower version
    Replaced,
    /// Existing record has a strictly higher version; nothing written
    Stale,
}

/// Durable store boundary: upsert-by-key plus timestamp-ordered reads
#[async_trait]
pub trait AppointmentStore: Send + Sync {
    /// Idempotent write keyed by appointment_id
    ///
    /// Operation: insert if absent, replace if the stored version is equal or
    /// lower, no-op if it is strictly higher.
    async fn upsert(&self, event: &AppointmentEvent) -> Result<UpsertOutcome, SinkError>;

    async fn get(&self, appointment_id: &str) -> Result<Option<PersistedRecord>, SinkError>;

    /// Most recent `limit` records by event timestamp, newest first
    async fn latest(&self, limit: usize, status: Option<AppointmentStatus>)
        -> Result<Vec<PersistedRecord>, SinkError>;

    /// Records with `from <= timestamp < to`, oldest first
    async fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PersistedRecord>, SinkError>;

    /// Every record, oldest first (rebuild path)
    async fn scan_all(&self) -> Result<Vec<PersistedRecord>, SinkError>;

    async fn count(&self) -> Result<u64, SinkError>;
}

/// Apply connection PRAGMAs (WAL, NORMAL sync, busy timeout)
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(Duration::from_millis(5_000))?;
    Ok(())
}

/// Run the embedded schema migrations
pub fn run_schema_migrations(conn: &Connection) -> rusqlite::Result<()> {
    for (name, sql) in SCHEMA {
        log::debug!("   ├─ Executing: {}", name);
        conn.execute_batch(sql)?;
    }
    log::info!("✅ Schema ready ({} migrations)", SCHEMA.len());
    Ok(())
}

/// SQLite implementation of `AppointmentStore`
///
/// Owns a writer connection and a separate `query_only` reader connection so
/// facade reads never wait on the ingestion writer's mutex.
pub struct SqliteAppointmentStore {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl SqliteAppointmentStore {
    /// Open (or create) the database at `db_path` and ensure the schema
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SinkError::Permanent(format!(
                        "Failed to create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let writer = Connection::open(db_path)?;
        apply_pragmas(&writer)?;
        run_schema_migrations(&writer)?;

        let reader = Connection::open(db_path)?;
        reader.busy_timeout(Duration::from_millis(5_000))?;
        reader.pragma_update(None, "query_only", "ON")?;

        log::info!("✅ Appointment store opened: {}", db_path.display());

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    /// Open an existing database read-only (reporting tools)
    pub fn open_read_only(db_path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path.as_ref(), flags)?;
        let reader = Arc::new(Mutex::new(conn));

        Ok(Self {
            writer: reader.clone(),
            reader,
        })
    }

    /// Shared writer connection, e.g. for a checkpoint store in the same file
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.writer.clone()
    }

    fn lock<'a>(conn: &'a Mutex<Connection>) -> Result<MutexGuard<'a, Connection>, SinkError> {
        conn.lock()
            .map_err(|_| SinkError::Permanent("connection mutex poisoned".to_string()))
    }

    fn upsert_blocking(conn: &mut Connection, event: &AppointmentEvent) -> Result<UpsertOutcome, SinkError> {
        let now_us = Utc::now().timestamp_micros();
        let tx = conn.transaction()?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT version FROM appointments WHERE appointment_id = ?1",
                [&event.appointment_id],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(stored) if stored > event.version => UpsertOutcome::Stale,
            Some(_) => {
                tx.execute(
                    r#"
                    UPDATE appointments SET
                        version = ?2, status = ?3, department = ?4, urgency = ?5,
                        cost_cents = ?6, copay_cents = ?7, timestamp_us = ?8,
                        city = ?9, payment_method = ?10, updated_at_us = ?11
                    WHERE appointment_id = ?1
                    "#,
                    params![
                        event.appointment_id,
                        event.version,
                        event.status.as_str(),
                        event.department,
                        event.urgency.as_str(),
                        event.cost_cents,
                        event.copay_cents,
                        event.timestamp.timestamp_micros(),
                        event.city,
                        event.payment_method.as_str(),
                        now_us,
                    ],
                )?;
                UpsertOutcome::Replaced
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO appointments (
                        appointment_id, version, status, department, urgency,
                        cost_cents, copay_cents, timestamp_us, city, payment_method,
                        inserted_at_us, updated_at_us
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                    "#,
                    params![
                        event.appointment_id,
                        event.version,
                        event.status.as_str(),
                        event.department,
                        event.urgency.as_str(),
                        event.cost_cents,
                        event.copay_cents,
                        event.timestamp.timestamp_micros(),
                        event.city,
                        event.payment_method.as_str(),
                        now_us,
                    ],
                )?;
                UpsertOutcome::Inserted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    fn query_records<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<PersistedRecord>, SinkError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

const RECORD_COLUMNS: &str = "appointment_id, version, status, department, urgency, cost_cents, \
     copay_cents, timestamp_us, city, payment_method, inserted_at_us, updated_at_us";

fn micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}

fn invalid_column(index: usize, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("unexpected value `{}`", value).into(),
    )
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<PersistedRecord> {
    let status: String = row.get(2)?;
    let urgency: String = row.get(4)?;
    let payment: String = row.get(9)?;

    let event = AppointmentEvent {
        appointment_id: row.get(0)?,
        version: row.get(1)?,
        status: AppointmentStatus::from_str(&status).ok_or_else(|| invalid_column(2, status.clone()))?,
        department: row.get(3)?,
        urgency: Urgency::from_str(&urgency).ok_or_else(|| invalid_column(4, urgency.clone()))?,
        cost_cents: row.get(5)?,
        copay_cents: row.get(6)?,
        timestamp: micros(row.get(7)?),
        city: row.get(8)?,
        payment_method: PaymentMethod::from_str(&payment).ok_or_else(|| invalid_column(9, payment.clone()))?,
    };

    Ok(PersistedRecord {
        event,
        inserted_at: micros(row.get(10)?),
        updated_at: micros(row.get(11)?),
    })
}

#[async_trait]
impl AppointmentStore for SqliteAppointmentStore {
    async fn upsert(&self, event: &AppointmentEvent) -> Result<UpsertOutcome, SinkError> {
        let mut conn = Self::lock(&self.writer)?;
        Self::upsert_blocking(&mut conn, event)
    }

    async fn get(&self, appointment_id: &str) -> Result<Option<PersistedRecord>, SinkError> {
        let conn = Self::lock(&self.reader)?;
        let sql = format!("SELECT {} FROM appointments WHERE appointment_id = ?1", RECORD_COLUMNS);
        Ok(conn.query_row(&sql, [appointment_id], record_from_row).optional()?)
    }

    async fn latest(
        &self,
        limit: usize,
        status: Option<AppointmentStatus>,
    ) -> Result<Vec<PersistedRecord>, SinkError> {
        let conn = Self::lock(&self.reader)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        match status {
            Some(status) => Self::query_records(
                &conn,
                &format!(
                    "SELECT {} FROM appointments WHERE status = ?1 \
                     ORDER BY timestamp_us DESC, appointment_id DESC LIMIT ?2",
                    RECORD_COLUMNS
                ),
                params![status.as_str(), limit],
            ),
            None => Self::query_records(
                &conn,
                &format!(
                    "SELECT {} FROM appointments \
                     ORDER BY timestamp_us DESC, appointment_id DESC LIMIT ?1",
                    RECORD_COLUMNS
                ),
                params![limit],
            ),
        }
    }

    async fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PersistedRecord>, SinkError> {
        let conn = Self::lock(&self.reader)?;
        Self::query_records(
            &conn,
            &format!(
                "SELECT {} FROM appointments WHERE timestamp_us >= ?1 AND timestamp_us < ?2 \
                 ORDER BY timestamp_us ASC, appointment_id ASC",
                RECORD_COLUMNS
            ),
            params![from.timestamp_micros(), to.timestamp_micros()],
        )
    }

    async fn scan_all(&self) -> Result<Vec<PersistedRecord>, SinkError> {
        let conn = Self::lock(&self.reader)?;
        Self::query_records(
            &conn,
            &format!(
                "SELECT {} FROM appointments ORDER BY timestamp_us ASC, appointment_id ASC",
                RECORD_COLUMNS
            ),
            [],
        )
    }

    async fn count(&self) -> Result<u64, SinkError> {
        let conn = Self::lock(&self.reader)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM appointments", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}
