//! Append log and consumer-group reading
//!
//! One physical log is shared by all partition keys. Readers in the same
//! consumer group receive disjoint entries; an entry stays in the group's
//! pending set until acknowledged, so an unacknowledged entry is eventually
//! redelivered.

use crate::{LogOffset, PartitionKey, Receipt, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Durable, append-only, multi-partition log
#[async_trait]
pub trait AppendLog: Send + Sync {
    /// Append serialized message bytes
    ///
    /// `key` is a routing hint only (backends may use it for partition
    /// affinity). Returns once the append is durable.
    async fn append(&self, key: &PartitionKey, payload: Bytes) -> Result<Receipt>;

    /// Append with a caller-chosen deduplication id
    ///
    /// Backends that deduplicate use `dedup_id` instead of deriving one from
    /// the payload. The default ignores it.
    async fn append_with_id(
        &self,
        key: &PartitionKey,
        payload: Bytes,
        dedup_id: &str,
    ) -> Result<Receipt> {
        let _ = dedup_id;
        self.append(key, payload).await
    }
}

/// Acknowledgement handle for one delivered entry
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Remove the entry from the group's pending set
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Give the entry back for immediate redelivery
    async fn release(self: Box<Self>) -> Result<()>;
}

/// One entry handed out by a [`GroupReader`]
pub struct LogEntry {
    /// Offset in the log
    pub offset: LogOffset,

    /// Raw entry bytes
    pub payload: Bytes,

    /// How many times the log has delivered this entry (1 on first delivery)
    pub delivery: u32,

    acker: Box<dyn Acknowledge>,
}

impl std::fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEntry")
            .field("offset", &self.offset)
            .field("len", &self.payload.len())
            .field("delivery", &self.delivery)
            .finish()
    }
}

impl LogEntry {
    /// Create entry
    pub fn new(
        offset: LogOffset,
        payload: Bytes,
        delivery: u32,
        acker: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            offset,
            payload,
            delivery,
            acker,
        }
    }

    /// Acknowledge
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Requeue
    pub async fn release(self) -> Result<()> {
        self.acker.release().await
    }
}

/// Competing-consumer reader bound to one consumer identity
#[async_trait]
pub trait GroupReader: Send {
    /// Consumer identity within the group
    fn consumer(&self) -> &str;

    /// Up to `max` entries, waiting at most `block` when none are ready
    ///
    /// An empty vector means the wait timed out.
    async fn read(&mut self, max: usize, block: Duration) -> Result<Vec<LogEntry>>;
}
