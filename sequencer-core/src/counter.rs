//! Sequence counter store
//!
//! Durable per-key "next expected sequence number". Safe for concurrent
//! callers on different keys; callers on the same key must be serialized
//! by the engine (see [`crate::locks`]).

use crate::{PartitionKey, Result};
use async_trait::async_trait;

/// Per-key next-sequence pointer store
#[async_trait]
pub trait SequenceCounterStore: Send + Sync {
    /// Return the pointer, creating it at 1 if absent
    async fn get_or_init(&self, key: &PartitionKey) -> Result<u64>;

    /// Increment and return the new value (creates at 1 first if absent)
    async fn advance(&self, key: &PartitionKey) -> Result<u64>;

    /// Increment only if the pointer still equals `expected`
    ///
    /// Fails with [`crate::Error::PointerConflict`] otherwise and leaves the
    /// pointer untouched.
    async fn compare_and_advance(&self, key: &PartitionKey, expected: u64) -> Result<u64>;

    /// Current pointer without initialising it
    async fn current(&self, key: &PartitionKey) -> Result<Option<u64>>;
}
