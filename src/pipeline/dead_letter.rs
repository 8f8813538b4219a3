//! Dead-letter boundary
//!
//! Records that fail decoding, and records the sink could not persist after
//! retries, are emitted here as `{raw_payload, reason, timestamp}` so an
//! operator can inspect and replay them.

use super::error::DeadLetterError;
use super::types::StreamPosition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadLetterKind {
    /// Rejected by the decoder; the offset moved past it
    Decode,
    /// Valid record the sink never persisted; the checkpoint is held
    Sink,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Original bytes, lossily decoded as UTF-8
    pub raw_payload: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub kind: DeadLetterKind,
    pub partition: u32,
    pub offset: u64,
}

impl DeadLetter {
    pub fn new(payload: &[u8], reason: impl Into<String>, kind: DeadLetterKind, position: StreamPosition) -> Self {
        Self {
            raw_payload: String::from_utf8_lossy(payload).into_owned(),
            reason: reason.into(),
            timestamp: Utc::now(),
            kind,
            partition: position.partition,
            offset: position.offset,
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send {
    async fn write(&mut self, letter: &DeadLetter) -> Result<(), DeadLetterError>;

    async fn flush(&mut self) -> Result<(), DeadLetterError>;

    fn backend_type(&self) -> &'static str;
}

/// Appends one JSON object per line
pub struct JsonlDeadLetterWriter {
    file: BufWriter<File>,
    written: u64,
}

impl JsonlDeadLetterWriter {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            file: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetterWriter {
    async fn write(&mut self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let json = serde_json::to_string(letter)?;
        writeln!(self.file, "{}", json)?;
        self.file.flush()?;
        self.written += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DeadLetterError> {
        self.file.flush()?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}

/// Collects dead letters in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetterSink {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn write(&mut self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        if let Ok(mut letters) = self.letters.lock() {
            letters.push(letter.clone());
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), DeadLetterError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jsonl_writer_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dead_letter.jsonl");

        let mut writer = JsonlDeadLetterWriter::new(&path).unwrap();
        let first = DeadLetter::new(b"{not json", "malformed payload", DeadLetterKind::Decode, StreamPosition::new(0, 0));
        let second = DeadLetter::new(b"{}", "missing required field `status`", DeadLetterKind::Decode, StreamPosition::new(0, 10));
        writer.write(&first).await.unwrap();
        writer.write(&second).await.unwrap();
        assert_eq!(writer.written(), 2);
        drop(writer);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<DeadLetter> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![first, second]);

        let raw: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(raw["raw_payload"], "{not json");
        assert_eq!(raw["reason"], "malformed payload");
        assert!(raw["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_memory_sink_shares_buffer() {
        let sink = MemoryDeadLetterSink::new();
        let mut writer = sink.clone();
        writer
            .write(&DeadLetter::new(&[0xff, b'x'], "bad", DeadLetterKind::Sink, StreamPosition::new(1, 4)))
            .await
            .unwrap();

        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].raw_payload, "\u{fffd}x");
        assert_eq!(letters[0].offset, 4);
    }
}
