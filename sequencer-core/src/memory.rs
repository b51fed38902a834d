//! In-process backends
//!
//! [`MemoryLog`] is a single-group consumer-group log and [`MemoryStore`] a
//! counter store, stash and dead-letter sink. Both live as long as the
//! process does; use them for tests and embedded pipelines, and
//! [`crate::Storage`] when the state must survive restarts.

use crate::{
    counter::SequenceCounterStore,
    dead_letter::DeadLetterSink,
    log::{Acknowledge, AppendLog, GroupReader, LogEntry},
    stash::{SequencerStore, Stash},
    DeadLetterRecord, Error, LogOffset, PartitionKey, Receipt, Result, StashEntry,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct LogState {
    entries: Vec<Bytes>,
    /// Next never-delivered index
    cursor: usize,
    /// Released or reclaimed offsets, served before new entries
    redeliver: VecDeque<u64>,
    /// offset -> owning consumer
    pending: HashMap<u64, String>,
    deliveries: HashMap<u64, u32>,
    /// dedup id -> offset of the first append
    dedup_ids: HashMap<String, u64>,
}

/// In-process append log with one consumer group
#[derive(Clone)]
pub struct MemoryLog {
    stream: String,
    state: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryLog")
            .field("stream", &self.stream)
            .field("entries", &state.entries.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl MemoryLog {
    /// Create empty log
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            state: Arc::new(Mutex::new(LogState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Reader for one consumer identity
    pub fn consumer(&self, name: impl Into<String>) -> MemoryReader {
        MemoryReader {
            log: self.clone(),
            name: name.into(),
        }
    }

    /// Entries ever appended
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True when nothing was appended
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries delivered but not yet acknowledged
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Entries waiting to be handed out (new or requeued)
    pub fn backlog(&self) -> usize {
        let state = self.state.lock();
        state.redeliver.len() + (state.entries.len() - state.cursor)
    }

    /// Hand a (crashed) consumer's pending entries back to the group
    pub fn reclaim(&self, consumer: &str) -> usize {
        let reclaimed = {
            let mut state = self.state.lock();
            let mut owned: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, owner)| owner.as_str() == consumer)
                .map(|(offset, _)| *offset)
                .collect();
            owned.sort_unstable();
            for offset in &owned {
                state.pending.remove(offset);
                state.redeliver.push_back(*offset);
            }
            owned.len()
        };

        if reclaimed > 0 {
            tracing::info!(consumer, reclaimed, "Reclaimed pending entries");
            self.notify.notify_waiters();
        }
        reclaimed
    }

    fn take_batch(&self, consumer: &str, max: usize) -> Vec<LogEntry> {
        let mut state = self.state.lock();
        let mut batch = Vec::new();

        while batch.len() < max {
            let offset = if let Some(offset) = state.redeliver.pop_front() {
                offset
            } else if state.cursor < state.entries.len() {
                state.cursor += 1;
                state.cursor as u64
            } else {
                break;
            };

            let payload = state.entries[(offset - 1) as usize].clone();
            let delivery = {
                let count = state.deliveries.entry(offset).or_insert(0);
                *count += 1;
                *count
            };
            state.pending.insert(offset, consumer.to_string());

            batch.push(LogEntry::new(
                LogOffset(offset),
                payload,
                delivery,
                Box::new(MemoryAck {
                    log: self.clone(),
                    offset,
                }),
            ));
        }

        batch
    }
}

#[async_trait]
impl AppendLog for MemoryLog {
    async fn append(&self, _key: &PartitionKey, payload: Bytes) -> Result<Receipt> {
        let offset = {
            let mut state = self.state.lock();
            state.entries.push(payload);
            state.entries.len() as u64
        };
        self.notify.notify_waiters();

        Ok(Receipt {
            stream: self.stream.clone(),
            offset: LogOffset(offset),
            duplicate: false,
        })
    }

    async fn append_with_id(
        &self,
        _key: &PartitionKey,
        payload: Bytes,
        dedup_id: &str,
    ) -> Result<Receipt> {
        let (offset, duplicate) = {
            let mut state = self.state.lock();
            match state.dedup_ids.get(dedup_id) {
                Some(offset) => (*offset, true),
                None => {
                    state.entries.push(payload);
                    let offset = state.entries.len() as u64;
                    state.dedup_ids.insert(dedup_id.to_string(), offset);
                    (offset, false)
                }
            }
        };
        if !duplicate {
            self.notify.notify_waiters();
        }

        Ok(Receipt {
            stream: self.stream.clone(),
            offset: LogOffset(offset),
            duplicate,
        })
    }
}

struct MemoryAck {
    log: MemoryLog,
    offset: u64,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.log.state.lock().pending.remove(&self.offset);
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<()> {
        {
            let mut state = self.log.state.lock();
            if state.pending.remove(&self.offset).is_some() {
                state.redeliver.push_back(self.offset);
            }
        }
        self.log.notify.notify_waiters();
        Ok(())
    }
}

/// [`GroupReader`] over a [`MemoryLog`]
#[derive(Debug)]
pub struct MemoryReader {
    log: MemoryLog,
    name: String,
}

#[async_trait]
impl GroupReader for MemoryReader {
    fn consumer(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, max: usize, block: Duration) -> Result<Vec<LogEntry>> {
        if max == 0 {
            return Err(Error::Log("batch size must be > 0".to_string()));
        }
        let deadline = tokio::time::Instant::now() + block;

        loop {
            // Register before checking so an append in between is not missed
            let notified = self.log.notify.notified();

            let batch = self.log.take_batch(&self.name, max);
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}

#[derive(Default)]
struct StoreState {
    counters: HashMap<PartitionKey, u64>,
    stash: HashMap<PartitionKey, BTreeMap<u64, Vec<u8>>>,
    dead_letters: Vec<DeadLetterRecord>,
}

impl StoreState {
    fn advance_if(&mut self, key: &PartitionKey, expected: u64) -> Result<u64> {
        let pointer = self.counters.entry(key.clone()).or_insert(1);
        if *pointer != expected {
            return Err(Error::PointerConflict {
                key: key.clone(),
                expected,
                actual: *pointer,
            });
        }
        *pointer += 1;
        Ok(*pointer)
    }
}

/// In-process counter store, stash and dead-letter sink
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryStore")
            .field("keys", &state.counters.len())
            .field("dead_letters", &state.dead_letters.len())
            .finish()
    }
}

impl MemoryStore {
    /// Create empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceCounterStore for MemoryStore {
    async fn get_or_init(&self, key: &PartitionKey) -> Result<u64> {
        Ok(*self.state.lock().counters.entry(key.clone()).or_insert(1))
    }

    async fn advance(&self, key: &PartitionKey) -> Result<u64> {
        let mut state = self.state.lock();
        let pointer = state.counters.entry(key.clone()).or_insert(1);
        *pointer += 1;
        Ok(*pointer)
    }

    async fn compare_and_advance(&self, key: &PartitionKey, expected: u64) -> Result<u64> {
        self.state.lock().advance_if(key, expected)
    }

    async fn current(&self, key: &PartitionKey) -> Result<Option<u64>> {
        Ok(self.state.lock().counters.get(key).copied())
    }
}

#[async_trait]
impl Stash for MemoryStore {
    async fn insert(&self, key: &PartitionKey, seq: u64, blob: &[u8]) -> Result<bool> {
        let mut state = self.state.lock();
        let entries = state.stash.entry(key.clone()).or_default();
        if entries.contains_key(&seq) {
            return Ok(false);
        }
        entries.insert(seq, blob.to_vec());
        Ok(true)
    }

    async fn get(&self, key: &PartitionKey, seq: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .state
            .lock()
            .stash
            .get(key)
            .and_then(|entries| entries.get(&seq).cloned()))
    }

    async fn range_query(&self, key: &PartitionKey, from: u64, to: u64) -> Result<Vec<StashEntry>> {
        if from > to {
            return Ok(Vec::new());
        }
        let state = self.state.lock();
        Ok(state
            .stash
            .get(key)
            .map(|entries| {
                entries
                    .range(from..=to)
                    .map(|(seq, blob)| StashEntry {
                        key: key.clone(),
                        message_number: *seq,
                        serialized_message: blob.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, key: &PartitionKey, seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(entries) = state.stash.get_mut(key) {
            entries.remove(&seq);
            if entries.is_empty() {
                state.stash.remove(key);
            }
        }
        Ok(())
    }

    async fn count(&self, key: &PartitionKey) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .stash
            .get(key)
            .map(|entries| entries.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl SequencerStore for MemoryStore {
    async fn release_stashed(&self, key: &PartitionKey, expected: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let next = state.advance_if(key, expected)?;
        if let Some(entries) = state.stash.get_mut(key) {
            entries.remove(&expected);
            if entries.is_empty() {
                state.stash.remove(key);
            }
        }
        Ok(next)
    }
}

#[async_trait]
impl DeadLetterSink for MemoryStore {
    async fn record(&self, record: DeadLetterRecord) -> Result<()> {
        self.state.lock().dead_letters.push(record);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        Ok(self
            .state
            .lock()
            .dead_letters
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}
