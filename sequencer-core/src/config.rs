//! Configuration for the sequencer

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// NATS server address
    pub nats_url: String,

    /// Stream holding incoming (unordered) messages
    pub incoming_stream: String,

    /// Stream holding dead-lettered messages
    pub dead_letter_stream: String,

    /// Subject prefix for incoming messages (`<prefix>.<partition>`)
    pub subject_prefix: String,

    /// Subject prefix for dead letters (`<prefix>.<partition>`)
    pub dead_letter_subject_prefix: String,

    /// Consumer group name
    pub consumer_group: String,

    /// This worker's consumer identity
    pub consumer_name: String,

    /// Max entries per read
    pub batch_size: usize,

    /// How long a read blocks waiting for entries (milliseconds)
    pub block_timeout_ms: u64,

    /// Retries before an entry is dead-lettered
    pub max_retries: u32,

    /// Number of routing partitions
    pub num_partitions: u32,

    /// Partitions owned by this process (empty = all)
    pub owned_partitions: Vec<u32>,

    /// Where dead letters go
    pub dead_letter_target: DeadLetterTarget,

    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Log output format
    pub log_format: LogFormat,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Read-failure backoff
    pub backoff: BackoffConfig,

    /// Publish retry policy
    pub publish: PublishConfig,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            incoming_stream: "LUNAR_INCOMING".to_string(),
            dead_letter_stream: "LUNAR_DEAD_LETTERS".to_string(),
            subject_prefix: "lunar.incoming".to_string(),
            dead_letter_subject_prefix: "lunar.dead-letters".to_string(),
            consumer_group: "sequencer-group".to_string(),
            consumer_name: format!("sequencer-{}", Uuid::new_v4()),
            batch_size: 50,
            block_timeout_ms: 1000,
            max_retries: 5,
            num_partitions: 32,
            owned_partitions: Vec::new(),
            dead_letter_target: DeadLetterTarget::Stream,
            data_dir: PathBuf::from("./data/sequencer"),
            log_format: LogFormat::Text,
            rocksdb: RocksDBConfig::default(),
            backoff: BackoffConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

/// Dead-letter destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterTarget {
    /// Dead-letter stream on the message bus
    Stream,
    /// Local RocksDB column family
    Local,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable
    Text,
    /// One JSON object per line
    Json,
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// fsync the WAL on every write
    pub sync_writes: bool,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            sync_writes: true,
            enable_statistics: false,
        }
    }
}

/// Exponential backoff for failed batch reads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay (milliseconds)
    pub initial_interval_ms: u64,

    /// Delay cap (milliseconds)
    pub max_interval_ms: u64,

    /// Growth factor
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 100,
            max_interval_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Build a fresh backoff that never gives up
    pub fn build(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(self.initial_interval_ms),
            current_interval: Duration::from_millis(self.initial_interval_ms),
            max_interval: Duration::from_millis(self.max_interval_ms),
            multiplier: self.multiplier,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Publish retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Max attempts per publish
    pub max_attempts: u32,

    /// Initial retry delay (milliseconds)
    pub initial_retry_delay_ms: u64,

    /// Max retry delay (milliseconds)
    pub max_retry_delay_ms: u64,

    /// Broker deduplication window (seconds)
    pub duplicate_window_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_retry_delay_ms: 100,
            max_retry_delay_ms: 2_000,
            duplicate_window_secs: 120,
        }
    }
}

impl SequencerConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SequencerConfig = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables on top of defaults
    pub fn from_env() -> crate::Result<Self> {
        let mut config = SequencerConfig::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `SEQUENCER_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(url) = std::env::var("SEQUENCER_NATS_URL") {
            self.nats_url = url;
        }
        if let Ok(stream) = std::env::var("SEQUENCER_INCOMING_STREAM") {
            self.incoming_stream = stream;
        }
        if let Ok(stream) = std::env::var("SEQUENCER_DEAD_LETTER_STREAM") {
            self.dead_letter_stream = stream;
        }
        if let Ok(group) = std::env::var("SEQUENCER_CONSUMER_GROUP") {
            self.consumer_group = group;
        }
        if let Ok(name) = std::env::var("SEQUENCER_CONSUMER_NAME") {
            self.consumer_name = name;
        }
        if let Ok(dir) = std::env::var("SEQUENCER_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(value) = std::env::var("SEQUENCER_BATCH_SIZE") {
            self.batch_size = parse_env("SEQUENCER_BATCH_SIZE", &value)?;
        }
        if let Ok(value) = std::env::var("SEQUENCER_BLOCK_TIMEOUT_MS") {
            self.block_timeout_ms = parse_env("SEQUENCER_BLOCK_TIMEOUT_MS", &value)?;
        }
        if let Ok(value) = std::env::var("SEQUENCER_MAX_RETRIES") {
            self.max_retries = parse_env("SEQUENCER_MAX_RETRIES", &value)?;
        }
        if let Ok(value) = std::env::var("SEQUENCER_OWNED_PARTITIONS") {
            self.owned_partitions = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_env("SEQUENCER_OWNED_PARTITIONS", s))
                .collect::<crate::Result<Vec<u32>>>()?;
        }
        if let Ok(value) = std::env::var("SEQUENCER_LOG_FORMAT") {
            self.log_format = match value.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => {
                    return Err(crate::Error::Config(format!(
                        "SEQUENCER_LOG_FORMAT must be text or json, got {}",
                        other
                    )))
                }
            };
        }
        Ok(())
    }

    /// Check invariants between fields
    pub fn validate(&self) -> crate::Result<()> {
        if self.batch_size == 0 {
            return Err(crate::Error::Config("batch_size must be > 0".to_string()));
        }
        if self.num_partitions == 0 {
            return Err(crate::Error::Config("num_partitions must be > 0".to_string()));
        }
        if let Some(p) = self
            .owned_partitions
            .iter()
            .find(|p| **p >= self.num_partitions)
        {
            return Err(crate::Error::Config(format!(
                "owned partition {} out of range (num_partitions = {})",
                p, self.num_partitions
            )));
        }
        if self.consumer_group.is_empty() || self.consumer_name.is_empty() {
            return Err(crate::Error::Config(
                "consumer_group and consumer_name must be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Read-block timeout
    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    /// Partitions this process consumes
    pub fn partitions(&self) -> Vec<u32> {
        if self.owned_partitions.is_empty() {
            (0..self.num_partitions).collect()
        } else {
            let mut owned = self.owned_partitions.clone();
            owned.sort_unstable();
            owned.dedup();
            owned
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("{} has invalid value {:?}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SequencerConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.block_timeout(), Duration::from_secs(1));
        assert!(config.consumer_name.starts_with("sequencer-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: SequencerConfig = toml::from_str(
            r#"
            consumer_group = "orders"
            max_retries = 2
            owned_partitions = [3, 1, 3]
            dead_letter_target = "local"

            [rocksdb]
            sync_writes = false
            "#,
        )
        .unwrap();

        assert_eq!(config.consumer_group, "orders");
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.dead_letter_target, DeadLetterTarget::Local);
        assert!(!config.rocksdb.sync_writes);
        assert_eq!(config.rocksdb.max_background_jobs, 4);
        assert_eq!(config.partitions(), vec![1, 3]);
    }

    #[test]
    fn test_validate_rejects_out_of_range_partition() {
        let mut config = SequencerConfig::default();
        config.num_partitions = 4;
        config.owned_partitions = vec![4];
        assert!(config.validate().is_err());

        config.owned_partitions = vec![];
        config.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_all_partitions_when_none_owned() {
        let mut config = SequencerConfig::default();
        config.num_partitions = 3;
        assert_eq!(config.partitions(), vec![0, 1, 2]);
    }
}
