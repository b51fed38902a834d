//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `counters` - Next-sequence pointers (key: len || partition key, value: u64 BE)
//! - `stash` - Out-of-order messages (key: len || partition key || seq BE)
//! - `dead_letters` - Dead-letter records (key: UUIDv7, value: JSON)
//!
//! Pointer and stash rows for one key share the same length-prefixed key
//! bytes, so a drained entry's delete and the pointer advance commit in one
//! `WriteBatch`.

use crate::{
    config::SequencerConfig,
    counter::SequenceCounterStore,
    dead_letter::DeadLetterSink,
    error::{Error, Result},
    stash::{SequencerStore, Stash},
    types::{DeadLetterRecord, PartitionKey, StashEntry},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::sync::Arc;

/// Column family names
const CF_COUNTERS: &str = "counters";
const CF_STASH: &str = "stash";
const CF_DEAD_LETTERS: &str = "dead_letters";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,

    /// Serializes read-modify-write sequences (pointer CAS, idempotent insert)
    write_lock: Mutex<()>,

    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &SequencerConfig) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_COUNTERS, Self::cf_options_counters()),
            ColumnFamilyDescriptor::new(CF_STASH, Self::cf_options_stash()),
            ColumnFamilyDescriptor::new(CF_DEAD_LETTERS, Self::cf_options_dead_letters()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened sequencer store");

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_counters() -> Options {
        let mut opts = Options::default();
        // Pointers are read on every message, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_stash() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Drain loop does one point lookup per sequence number
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_options_dead_letters() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    // Helpers

    fn cf_handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    fn stash_key(key: &PartitionKey, seq: u64) -> Vec<u8> {
        let mut bytes = key.storage_prefix();
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes
    }

    fn decode_seq(raw: &[u8]) -> Result<u64> {
        let start = raw
            .len()
            .checked_sub(8)
            .ok_or_else(|| Error::Storage("Stash key too short".to_string()))?;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&raw[start..]);
        Ok(u64::from_be_bytes(seq))
    }

    fn decode_counter(raw: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = raw
            .try_into()
            .map_err(|_| Error::Storage(format!("Corrupt counter value ({} bytes)", raw.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn read_counter(&self, key: &PartitionKey) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_COUNTERS)?;
        match self.db.get_cf(&cf, key.storage_prefix())? {
            Some(raw) => Ok(Some(Self::decode_counter(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_counter(&self, batch: &mut WriteBatch, key: &PartitionKey, value: u64) -> Result<()> {
        let cf = self.cf_handle(CF_COUNTERS)?;
        batch.put_cf(&cf, key.storage_prefix(), value.to_be_bytes());
        Ok(())
    }

    /// Conditional advance, optionally deleting a stash row in the same batch
    fn advance_if(&self, key: &PartitionKey, expected: u64, drained: Option<u64>) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let actual = self.read_counter(key)?.unwrap_or(1);
        if actual != expected {
            return Err(Error::PointerConflict {
                key: key.clone(),
                expected,
                actual,
            });
        }

        let next = expected + 1;
        let mut batch = WriteBatch::default();
        self.write_counter(&mut batch, key, next)?;
        if let Some(seq) = drained {
            let cf_stash = self.cf_handle(CF_STASH)?;
            batch.delete_cf(&cf_stash, Self::stash_key(key, seq));
        }
        self.db.write_opt(batch, &self.write_options())?;

        Ok(next)
    }

    /// Scan one key's stash rows starting at `from`, stopping when `f` returns false
    fn scan_stash(
        &self,
        key: &PartitionKey,
        from: u64,
        mut f: impl FnMut(u64, &[u8]) -> bool,
    ) -> Result<()> {
        let cf = self.cf_handle(CF_STASH)?;
        let prefix = key.storage_prefix();
        let start = Self::stash_key(key, from);

        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        for item in iter {
            let (raw_key, value) = item?;
            if !raw_key.starts_with(&prefix) || raw_key.len() != prefix.len() + 8 {
                break;
            }
            let seq = Self::decode_seq(&raw_key)?;
            if !f(seq, &value) {
                break;
            }
        }

        Ok(())
    }

    /// Get storage statistics
    pub fn get_stats(&self) -> Result<StorageStats> {
        let cf_counters = self.cf_handle(CF_COUNTERS)?;
        let cf_stash = self.cf_handle(CF_STASH)?;
        let cf_dead = self.cf_handle(CF_DEAD_LETTERS)?;

        let approximate = |cf: &Arc<BoundColumnFamily<'_>>| -> Result<u64> {
            Ok(self
                .db
                .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
                .unwrap_or(0))
        };

        Ok(StorageStats {
            total_keys: approximate(&cf_counters)?,
            total_stashed: approximate(&cf_stash)?,
            total_dead_letters: approximate(&cf_dead)?,
        })
    }

    /// Flush memtables (graceful shutdown)
    pub fn flush(&self) -> Result<()> {
        for name in [CF_COUNTERS, CF_STASH, CF_DEAD_LETTERS] {
            let cf = self.cf_handle(name)?;
            self.db.flush_cf(&cf)?;
        }
        tracing::info!("Sequencer store flushed");
        Ok(())
    }
}

#[async_trait]
impl SequenceCounterStore for Storage {
    async fn get_or_init(&self, key: &PartitionKey) -> Result<u64> {
        if let Some(next) = self.read_counter(key)? {
            return Ok(next);
        }

        let _guard = self.write_lock.lock();
        if let Some(next) = self.read_counter(key)? {
            return Ok(next);
        }

        let mut batch = WriteBatch::default();
        self.write_counter(&mut batch, key, 1)?;
        self.db.write_opt(batch, &self.write_options())?;

        tracing::debug!(key = %key, "Initialised sequence pointer");
        Ok(1)
    }

    async fn advance(&self, key: &PartitionKey) -> Result<u64> {
        let _guard = self.write_lock.lock();

        let next = self.read_counter(key)?.unwrap_or(1) + 1;
        let mut batch = WriteBatch::default();
        self.write_counter(&mut batch, key, next)?;
        self.db.write_opt(batch, &self.write_options())?;

        Ok(next)
    }

    async fn compare_and_advance(&self, key: &PartitionKey, expected: u64) -> Result<u64> {
        self.advance_if(key, expected, None)
    }

    async fn current(&self, key: &PartitionKey) -> Result<Option<u64>> {
        self.read_counter(key)
    }
}

#[async_trait]
impl Stash for Storage {
    async fn insert(&self, key: &PartitionKey, seq: u64, blob: &[u8]) -> Result<bool> {
        let cf = self.cf_handle(CF_STASH)?;
        let row = Self::stash_key(key, seq);

        let _guard = self.write_lock.lock();
        if self.db.get_pinned_cf(&cf, &row)?.is_some() {
            return Ok(false);
        }
        self.db.put_cf_opt(&cf, &row, blob, &self.write_options())?;

        tracing::debug!(key = %key, seq, "Stashed message");
        Ok(true)
    }

    async fn get(&self, key: &PartitionKey, seq: u64) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(CF_STASH)?;
        Ok(self.db.get_cf(&cf, Self::stash_key(key, seq))?)
    }

    async fn range_query(&self, key: &PartitionKey, from: u64, to: u64) -> Result<Vec<StashEntry>> {
        let mut entries = Vec::new();
        if from > to {
            return Ok(entries);
        }

        self.scan_stash(key, from, |seq, value| {
            if seq > to {
                return false;
            }
            entries.push(StashEntry {
                key: key.clone(),
                message_number: seq,
                serialized_message: value.to_vec(),
            });
            true
        })?;

        Ok(entries)
    }

    async fn delete(&self, key: &PartitionKey, seq: u64) -> Result<()> {
        let cf = self.cf_handle(CF_STASH)?;
        self.db
            .delete_cf_opt(&cf, Self::stash_key(key, seq), &self.write_options())?;
        Ok(())
    }

    async fn count(&self, key: &PartitionKey) -> Result<u64> {
        let mut count = 0u64;
        self.scan_stash(key, 0, |_, _| {
            count += 1;
            true
        })?;
        Ok(count)
    }
}

#[async_trait]
impl SequencerStore for Storage {
    async fn release_stashed(&self, key: &PartitionKey, expected: u64) -> Result<u64> {
        self.advance_if(key, expected, Some(expected))
    }
}

#[async_trait]
impl DeadLetterSink for Storage {
    async fn record(&self, record: DeadLetterRecord) -> Result<()> {
        let cf = self.cf_handle(CF_DEAD_LETTERS)?;
        let value = serde_json::to_vec(&record)?;
        self.db
            .put_cf_opt(&cf, record.id.as_bytes(), value, &self.write_options())?;

        tracing::debug!(id = %record.id, reason = %record.reason, "Dead letter recorded");
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let cf = self.cf_handle(CF_DEAD_LETTERS)?;

        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start).take(limit) {
            let (_, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }

        Ok(records)
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Keys with a pointer (approximate)
    pub total_keys: u64,
    /// Stashed entries across all keys (approximate)
    pub total_stashed: u64,
    /// Dead-letter records (approximate)
    pub total_dead_letters: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeadLetterPayload, LogOffset, SequencedMessage};
    use chrono::Utc;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config() -> (SequencerConfig, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = SequencerConfig::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        (config, temp_dir)
    }

    #[tokio::test]
    async fn test_get_or_init_starts_at_one() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let key = PartitionKey::new("A");

        assert_eq!(storage.current(&key).await.unwrap(), None);
        assert_eq!(storage.get_or_init(&key).await.unwrap(), 1);
        assert_eq!(storage.advance(&key).await.unwrap(), 2);
        // Present: returned unchanged
        assert_eq!(storage.get_or_init(&key).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_compare_and_advance_conflict() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let key = PartitionKey::new("A");

        storage.get_or_init(&key).await.unwrap();
        assert_eq!(storage.compare_and_advance(&key, 1).await.unwrap(), 2);

        let err = storage.compare_and_advance(&key, 1).await.unwrap_err();
        assert!(matches!(
            err,
            Error::PointerConflict { expected: 1, actual: 2, .. }
        ));
        assert_eq!(storage.current(&key).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_stash_insert_is_idempotent() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let key = PartitionKey::new("A");

        assert!(storage.insert(&key, 3, b"first").await.unwrap());
        assert!(!storage.insert(&key, 3, b"second").await.unwrap());
        assert_eq!(storage.get(&key, 3).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(storage.count(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_range_query_is_ordered_and_key_scoped() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let a = PartitionKey::new("A");
        let ab = PartitionKey::new("AB");

        for seq in [9u64, 2, 300, 5] {
            storage.insert(&a, seq, &seq.to_be_bytes()).await.unwrap();
        }
        storage.insert(&ab, 4, b"other key").await.unwrap();

        let entries = storage.range_query(&a, 2, 9).await.unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.message_number).collect();
        assert_eq!(seqs, vec![2, 5, 9]);
        assert!(entries.iter().all(|e| e.key == a));

        assert_eq!(storage.count(&a).await.unwrap(), 4);
        assert_eq!(storage.count(&ab).await.unwrap(), 1);
        assert!(storage.range_query(&a, 10, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_stashed_is_atomic_pair() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();
        let key = PartitionKey::new("A");

        storage.get_or_init(&key).await.unwrap();
        storage.advance(&key).await.unwrap();
        storage.insert(&key, 2, b"two").await.unwrap();

        assert_eq!(storage.release_stashed(&key, 2).await.unwrap(), 3);
        assert_eq!(storage.get(&key, 2).await.unwrap(), None);

        // Wrong pointer: neither the pointer nor the stash changes
        storage.insert(&key, 5, b"five").await.unwrap();
        assert!(storage.release_stashed(&key, 5).await.is_err());
        assert!(storage.get(&key, 5).await.unwrap().is_some());
        assert_eq!(storage.current(&key).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let (config, _temp) = test_config();
        let key = PartitionKey::new("A");
        {
            let storage = Storage::open(&config).unwrap();
            storage.get_or_init(&key).await.unwrap();
            storage.advance(&key).await.unwrap();
            storage.insert(&key, 4, b"four").await.unwrap();
            storage.flush().unwrap();
        }

        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.current(&key).await.unwrap(), Some(2));
        assert_eq!(storage.count(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dead_letters_listed_oldest_first() {
        let (config, _temp) = test_config();
        let storage = Storage::open(&config).unwrap();

        for n in 1..=3u64 {
            let message = SequencedMessage::new("A", n, "T", Utc::now(), json!({ "n": n }));
            let record = DeadLetterRecord::for_message(message, "boom", Some(LogOffset(n)));
            storage.record(record).await.unwrap();
        }

        let records = storage.list(10).await.unwrap();
        assert_eq!(records.len(), 3);
        let offsets: Vec<_> = records.iter().map(|r| r.original_offset).collect();
        assert_eq!(
            offsets,
            vec![Some(LogOffset(1)), Some(LogOffset(2)), Some(LogOffset(3))]
        );
        assert!(matches!(records[0].original, DeadLetterPayload::Message(_)));
        assert_eq!(storage.list(2).await.unwrap().len(), 2);
    }
}
