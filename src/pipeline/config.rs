//! Pipeline configuration from environment variables

use super::engine::EngineConfig;
use super::error::ConfigError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Configuration for the pipeline runtime
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Append-only JSONL file the event source tails
    pub source_path: String,

    /// Checkpoint key (source name, partition)
    pub source_name: String,
    pub partition: u32,

    /// Channel buffer between the source reader and ingestion (records)
    pub channel_buffer: usize,

    pub poll_timeout_ms: u64,
    pub source_retry_initial_ms: u64,
    pub source_retry_max_ms: u64,

    /// Bucket width in seconds and how many buckets are retained
    pub bucket_secs: i64,
    pub retention_buckets: usize,

    pub sink_max_retries: u32,
    pub sink_retry_initial_ms: u64,
    pub sink_retry_max_ms: u64,

    /// Commit the checkpoint after this many records (also committed on every flush tick)
    pub checkpoint_every: u64,

    pub flush_interval_ms: u64,

    pub dead_letter_path: String,

    /// Replay the store into the engine before consuming
    pub rebuild_on_start: bool,

    /// How often the runtime logs a facade report
    pub report_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("⚠️  Ignoring unparseable {}={}, using default", key, raw);
                default
            }
        },
        None => default,
    }
}

fn text(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl PipelineConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `CLINICFLOW_DB_PATH` (default: data/clinicflow.db)
    /// - `APPOINTMENTS_SOURCE_PATH` (default: streams/appointments.jsonl)
    /// - `APPOINTMENTS_SOURCE_NAME` (default: appointments)
    /// - `APPOINTMENTS_PARTITION` (default: 0)
    /// - `STREAMER_CHANNEL_BUFFER` (default: 10000)
    /// - `SOURCE_POLL_TIMEOUT_MS` (default: 500)
    /// - `SOURCE_RETRY_INITIAL_MS` / `SOURCE_RETRY_MAX_MS` (default: 500 / 30000)
    /// - `BUCKET_SECS` (default: 60)
    /// - `RETENTION_BUCKETS` (default: 60)
    /// - `SINK_MAX_RETRIES` (default: 5)
    /// - `SINK_RETRY_INITIAL_MS` / `SINK_RETRY_MAX_MS` (default: 100 / 5000)
    /// - `CHECKPOINT_EVERY` (default: 100)
    /// - `FLUSH_INTERVAL_MS` (default: 5000)
    /// - `DEAD_LETTER_PATH` (default: streams/dead_letter.jsonl)
    /// - `REBUILD_ON_START` (default: true)
    /// - `REPORT_INTERVAL_SECS` (default: 10)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, map, ...)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            db_path: text(&lookup, "CLINICFLOW_DB_PATH", "data/clinicflow.db"),
            source_path: text(&lookup, "APPOINTMENTS_SOURCE_PATH", "streams/appointments.jsonl"),
            source_name: text(&lookup, "APPOINTMENTS_SOURCE_NAME", "appointments"),
            partition: parsed(&lookup, "APPOINTMENTS_PARTITION", 0),
            channel_buffer: parsed(&lookup, "STREAMER_CHANNEL_BUFFER", 10_000),
            poll_timeout_ms: parsed(&lookup, "SOURCE_POLL_TIMEOUT_MS", 500),
            source_retry_initial_ms: parsed(&lookup, "SOURCE_RETRY_INITIAL_MS", 500),
            source_retry_max_ms: parsed(&lookup, "SOURCE_RETRY_MAX_MS", 30_000),
            bucket_secs: parsed(&lookup, "BUCKET_SECS", 60),
            retention_buckets: parsed(&lookup, "RETENTION_BUCKETS", 60),
            sink_max_retries: parsed(&lookup, "SINK_MAX_RETRIES", 5),
            sink_retry_initial_ms: parsed(&lookup, "SINK_RETRY_INITIAL_MS", 100),
            sink_retry_max_ms: parsed(&lookup, "SINK_RETRY_MAX_MS", 5_000),
            checkpoint_every: parsed(&lookup, "CHECKPOINT_EVERY", 100),
            flush_interval_ms: parsed(&lookup, "FLUSH_INTERVAL_MS", 5_000),
            dead_letter_path: text(&lookup, "DEAD_LETTER_PATH", "streams/dead_letter.jsonl"),
            rebuild_on_start: parsed(&lookup, "REBUILD_ON_START", true),
            report_interval_secs: parsed(&lookup, "REPORT_INTERVAL_SECS", 10),
        }
    }

    /// Reject values that would make the pipeline spin or never emit
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&str, bool); 6] = [
            ("BUCKET_SECS", self.bucket_secs > 0),
            ("RETENTION_BUCKETS", self.retention_buckets > 0),
            ("STREAMER_CHANNEL_BUFFER", self.channel_buffer > 0),
            ("SOURCE_POLL_TIMEOUT_MS", self.poll_timeout_ms > 0),
            ("CHECKPOINT_EVERY", self.checkpoint_every > 0),
            ("FLUSH_INTERVAL_MS", self.flush_interval_ms > 0),
        ];

        for (key, ok) in positive {
            if !ok {
                return Err(ConfigError::InvalidValue(format!("{} must be greater than zero", key)));
            }
        }

        if self.sink_retry_initial_ms > self.sink_retry_max_ms {
            return Err(ConfigError::InvalidValue(
                "SINK_RETRY_INITIAL_MS must not exceed SINK_RETRY_MAX_MS".to_string(),
            ));
        }
        if self.source_retry_initial_ms > self.source_retry_max_ms {
            return Err(ConfigError::InvalidValue(
                "SOURCE_RETRY_INITIAL_MS must not exceed SOURCE_RETRY_MAX_MS".to_string(),
            ));
        }

        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            bucket_secs: self.bucket_secs,
            retention_buckets: self.retention_buckets,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> PipelineConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        // Test: Defaults when nothing is set
        let config = PipelineConfig::default();

        assert_eq!(config.db_path, "data/clinicflow.db");
        assert_eq!(config.source_path, "streams/appointments.jsonl");
        assert_eq!(config.source_name, "appointments");
        assert_eq!(config.partition, 0);
        assert_eq!(config.channel_buffer, 10_000);
        assert_eq!(config.bucket_secs, 60);
        assert_eq!(config.retention_buckets, 60);
        assert_eq!(config.sink_max_retries, 5);
        assert_eq!(config.checkpoint_every, 100);
        assert_eq!(config.flush_interval_ms, 5_000);
        assert!(config.rebuild_on_start);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_custom_config() {
        // Test: Values are read from the lookup
        let config = config_from(&[
            ("CLINICFLOW_DB_PATH", "/tmp/test.db"),
            ("STREAMER_CHANNEL_BUFFER", "5000"),
            ("BUCKET_SECS", "300"),
            ("REBUILD_ON_START", "false"),
            ("APPOINTMENTS_PARTITION", "3"),
        ]);

        assert_eq!(config.db_path, "/tmp/test.db");
        assert_eq!(config.channel_buffer, 5_000);
        assert_eq!(config.bucket_secs, 300);
        assert_eq!(config.engine_config().bucket_secs, 300);
        assert!(!config.rebuild_on_start);
        assert_eq!(config.partition, 3);
    }

    #[test]
    fn test_unparseable_value_falls_back_to_default() {
        let config = config_from(&[("RETENTION_BUCKETS", "lots"), ("CLINICFLOW_DB_PATH", "  ")]);
        assert_eq!(config.retention_buckets, 60);
        assert_eq!(config.db_path, "data/clinicflow.db");
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let err = config_from(&[("BUCKET_SECS", "0")]).validate().unwrap_err();
        assert!(err.to_string().contains("BUCKET_SECS"));

        assert!(config_from(&[("RETENTION_BUCKETS", "0")]).validate().is_err());
        assert!(config_from(&[("STREAMER_CHANNEL_BUFFER", "0")]).validate().is_err());
        assert!(config_from(&[("SOURCE_POLL_TIMEOUT_MS", "0")]).validate().is_err());
        assert!(config_from(&[("SINK_RETRY_INITIAL_MS", "9000")]).validate().is_err());
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        env::set_var("CHECKPOINT_EVERY", "7");
        let config = PipelineConfig::from_env();
        env::remove_var("CHECKPOINT_EVERY");

        assert_eq!(config.checkpoint_every, 7);
    }
}
