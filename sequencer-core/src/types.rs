//! Core types for the sequencer
//!
//! Sequence numbers are 1-based ordinals scoped to a single [`PartitionKey`].
//! Nothing here orders messages across keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier scoping an independent ordering domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Create a partition key
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Key as string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compute partition number for partition-affine routing
    pub fn partition_number(&self, num_partitions: u32) -> u32 {
        if num_partitions <= 1 {
            return 0;
        }
        let hash = blake3::hash(self.0.as_bytes());
        let hash_bytes = hash.as_bytes();
        let hash_u32 =
            u32::from_le_bytes([hash_bytes[0], hash_bytes[1], hash_bytes[2], hash_bytes[3]]);
        hash_u32 % num_partitions
    }

    /// Length-prefixed key bytes; every storage row for this key starts with it
    pub(crate) fn storage_prefix(&self) -> Vec<u8> {
        let bytes = self.0.as_bytes();
        let mut prefix = Vec::with_capacity(4 + bytes.len());
        prefix.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        prefix.extend_from_slice(bytes);
        prefix
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PartitionKey {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for PartitionKey {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// A numbered event for one partition key
///
/// Immutable once created. `retry_count` is only ever bumped by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedMessage {
    /// Partition key
    pub key: PartitionKey,

    /// 1-based sequence number within the key
    pub message_number: u64,

    /// Event type tag (interpreted downstream only)
    pub message_type: String,

    /// When the event happened at the source
    #[serde(rename = "messageTime")]
    pub occurred_at: DateTime<Utc>,

    /// Opaque payload
    pub payload: serde_json::Value,

    /// Failed processing attempts so far
    #[serde(default)]
    pub retry_count: u32,
}

impl SequencedMessage {
    /// Create new message with zero retries
    pub fn new(
        key: impl Into<PartitionKey>,
        message_number: u64,
        message_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            key: key.into(),
            message_number,
            message_type: message_type.into(),
            occurred_at,
            payload,
            retry_count: 0,
        }
    }

    /// Copy of this message with one more failed attempt recorded
    pub fn with_retry(&self) -> Self {
        let mut next = self.clone();
        next.retry_count = self.retry_count.saturating_add(1);
        next
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Next expected sequence number for a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextSequencePointer {
    /// Partition key
    pub key: PartitionKey,
    /// Next sequence number to emit (starts at 1)
    pub next: u64,
}

/// Out-of-order message waiting for its predecessors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    /// Partition key
    pub key: PartitionKey,
    /// Sequence number
    pub message_number: u64,
    /// Serialized [`SequencedMessage`]
    pub serialized_message: Vec<u8>,
}

/// Position of an entry in the append log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogOffset(pub u64);

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable append confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Stream the entry was appended to
    pub stream: String,
    /// Offset assigned by the log
    pub offset: LogOffset,
    /// Log recognised the append as a duplicate of an earlier one
    pub duplicate: bool,
}

/// What was captured of a dead-lettered message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeadLetterPayload {
    /// Message decoded fine but kept failing
    Message(SequencedMessage),
    /// Bytes that could not be decoded
    Raw(Vec<u8>),
}

/// Terminal record of a message the engine gave up on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Record ID (UUIDv7, sorts chronologically)
    pub id: Uuid,

    /// Original message or raw bytes
    pub original: DeadLetterPayload,

    /// Failure reason
    pub reason: String,

    /// Failed attempts at the time of dead-lettering
    pub retry_count: u32,

    /// Offset of the log entry that was dead-lettered (absent for stash-origin records)
    pub original_offset: Option<LogOffset>,

    /// When the record was written
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Record for a decoded message
    pub fn for_message(
        message: SequencedMessage,
        reason: impl Into<String>,
        original_offset: Option<LogOffset>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            retry_count: message.retry_count,
            original: DeadLetterPayload::Message(message),
            reason: reason.into(),
            original_offset,
            recorded_at: Utc::now(),
        }
    }

    /// Record for bytes that never decoded
    pub fn for_raw(
        raw: Vec<u8>,
        reason: impl Into<String>,
        original_offset: Option<LogOffset>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            original: DeadLetterPayload::Raw(raw),
            reason: reason.into(),
            retry_count: 0,
            original_offset,
            recorded_at: Utc::now(),
        }
    }

    /// Partition key, when the original message decoded
    pub fn key(&self) -> Option<&PartitionKey> {
        match &self.original {
            DeadLetterPayload::Message(message) => Some(&message.key),
            DeadLetterPayload::Raw(_) => None,
        }
    }
}
