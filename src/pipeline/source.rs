//! Event sources: where raw appointment records come from
//!
//! A source is one partition of an append-only stream. It hands out raw
//! payloads with their position and can be repositioned to a committed
//! offset on restart.

use super::error::SourceError;
use super::types::{SourceRecord, StreamPosition};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::{sleep, Instant};

#[async_trait]
pub trait EventSource: Send {
    /// Reposition so the next record read is the one at `offset`
    async fn seek(&mut self, offset: u64) -> Result<(), SourceError>;

    /// Wait up to `timeout` for the next record
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceRecord>, SourceError>;

    /// Human-readable description for logging
    fn describe(&self) -> String;
}

/// Tails an append-only JSONL file; offsets are byte offsets of line starts
pub struct JsonlFileSource {
    path: PathBuf,
    partition: u32,
    reader: Option<BufReader<File>>,
    offset: u64,
    poll_interval: Duration,
}

impl JsonlFileSource {
    pub fn new(path: impl Into<PathBuf>, partition: u32) -> Self {
        Self {
            path: path.into(),
            partition,
            reader: None,
            offset: 0,
            poll_interval: Duration::from_millis(100),
        }
    }

    async fn open(&mut self) -> Result<(), SourceError> {
        let file = File::open(&self.path).await.map_err(|e| {
            SourceError::Unavailable(format!("cannot open {}: {}", self.path.display(), e))
        })?;

        let len = file.metadata().await?.len();
        if self.offset > len {
            // Truncated or replaced since the offset was committed
            log::warn!(
                "⚠️  Offset {} beyond end of {} ({} bytes), restarting from 0",
                self.offset,
                self.path.display(),
                len
            );
            self.offset = 0;
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset)).await?;
        self.reader = Some(reader);

        log::info!("📖 Reading {} from offset {}", self.path.display(), self.offset);
        Ok(())
    }
}

#[async_trait]
impl EventSource for JsonlFileSource {
    async fn seek(&mut self, offset: u64) -> Result<(), SourceError> {
        self.offset = offset;
        self.reader = None;
        self.open().await
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceRecord>, SourceError> {
        if self.reader.is_none() {
            self.open().await?;
        }

        let deadline = Instant::now() + timeout;

        loop {
            let Some(reader) = self.reader.as_mut() else {
                return Err(SourceError::Unavailable("reader not open".to_string()));
            };

            let mut line = Vec::new();
            let read = reader.read_until(b'\n', &mut line).await?;

            if read > 0 && line.last() == Some(&b'\n') {
                let start = self.offset;
                self.offset += read as u64;

                let payload = line.trim_ascii().to_vec();
                if payload.is_empty() {
                    continue;
                }

                return Ok(Some(SourceRecord {
                    position: StreamPosition::new(self.partition, start),
                    next_offset: self.offset,
                    payload,
                }));
            }

            if read > 0 {
                // Partial line: the writer has not finished it yet. Rewind so
                // the whole line is read once complete.
                reader.seek(SeekFrom::Start(self.offset)).await?;
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    fn describe(&self) -> String {
        format!("jsonl:{} (partition {})", self.path.display(), self.partition)
    }
}

/// In-memory source; offsets are record indices
///
/// Clones share the same log, so a test can keep a handle and append while the
/// pipeline owns the source.
#[derive(Clone)]
pub struct MemorySource {
    partition: u32,
    log: Arc<Mutex<Vec<Vec<u8>>>>,
    failures: Arc<Mutex<VecDeque<String>>>,
    cursor: u64,
}

impl MemorySource {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            log: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            cursor: 0,
        }
    }

    pub fn with_records<I, P>(partition: u32, records: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        let source = Self::new(partition);
        for record in records {
            source.push(record);
        }
        source
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        if let Ok(mut log) = self.log.lock() {
            log.push(payload.into());
        }
    }

    /// Make the next poll fail with `SourceError::Unavailable`
    pub fn fail_next_poll(&self, reason: impl Into<String>) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(reason.into());
        }
    }

    pub fn len(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_record(&mut self) -> Result<Option<SourceRecord>, SourceError> {
        let log = self
            .log
            .lock()
            .map_err(|_| SourceError::Unavailable("memory log poisoned".to_string()))?;

        let Some(payload) = log.get(self.cursor as usize) else {
            return Ok(None);
        };

        let record = SourceRecord {
            position: StreamPosition::new(self.partition, self.cursor),
            next_offset: self.cursor + 1,
            payload: payload.clone(),
        };
        self.cursor += 1;
        Ok(Some(record))
    }
}

#[async_trait]
impl EventSource for MemorySource {
    async fn seek(&mut self, offset: u64) -> Result<(), SourceError> {
        self.cursor = offset;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<SourceRecord>, SourceError> {
        let injected = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(reason) = injected {
            return Err(SourceError::Unavailable(reason));
        }

        if let Some(record) = self.next_record()? {
            return Ok(Some(record));
        }

        // Nothing buffered: wait out a short slice of the timeout, then retry once
        sleep(timeout.min(Duration::from_millis(10))).await;
        self.next_record()
    }

    fn describe(&self) -> String {
        format!("memory (partition {})", self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn append(path: &std::path::Path, data: &[u8]) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(data).await.unwrap();
        file.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_jsonl_source_reads_lines_with_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appointments.jsonl");
        append(&path, b"{\"a\":1}\n\n{\"b\":2}\n").await;

        let mut source = JsonlFileSource::new(&path, 0);
        let first = source.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(first.payload, b"{\"a\":1}");
        assert_eq!(first.position, StreamPosition::new(0, 0));
        assert_eq!(first.next_offset, 8);

        // Blank line is skipped, offsets still track bytes
        let second = source.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(second.payload, b"{\"b\":2}");
        assert_eq!(second.position.offset, 9);
        assert_eq!(second.next_offset, 17);

        assert!(source.poll(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_jsonl_source_waits_for_complete_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appointments.jsonl");
        append(&path, b"{\"partial\":").await;

        let mut source = JsonlFileSource::new(&path, 0);
        assert!(source.poll(Duration::from_millis(20)).await.unwrap().is_none());

        append(&path, b"true}\n").await;
        let record = source.poll(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(record.payload, b"{\"partial\":true}");
        assert_eq!(record.position.offset, 0);
    }

    #[tokio::test]
    async fn test_jsonl_source_seek_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appointments.jsonl");
        append(&path, b"one\ntwo\nthree\n").await;

        let mut source = JsonlFileSource::new(&path, 3);
        source.seek(4).await.unwrap();
        let record = source.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(record.payload, b"two");
        assert_eq!(record.next_position(), StreamPosition::new(3, 8));
    }

    #[tokio::test]
    async fn test_jsonl_source_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = JsonlFileSource::new(dir.path().join("absent.jsonl"), 0);
        let err = source.poll(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_memory_source_shared_log() {
        let handle = MemorySource::with_records(1, ["a", "b"]);
        let mut source = handle.clone();

        let first = source.poll(Duration::from_millis(5)).await.unwrap().unwrap();
        assert_eq!(first.position, StreamPosition::new(1, 0));
        assert_eq!(first.next_offset, 1);

        handle.push("c");
        handle.fail_next_poll("broker down");
        assert!(matches!(
            source.poll(Duration::from_millis(5)).await,
            Err(SourceError::Unavailable(_))
        ));

        source.seek(2).await.unwrap();
        let third = source.poll(Duration::from_millis(5)).await.unwrap().unwrap();
        assert_eq!(third.payload, b"c");
        assert!(source.poll(Duration::from_millis(5)).await.unwrap().is_none());
    }
}
