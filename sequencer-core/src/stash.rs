//! Stash of out-of-order messages
//!
//! Entries are keyed by `(key, message_number)` and scoped to a single key;
//! there are no cross-key operations.

use crate::{counter::SequenceCounterStore, PartitionKey, Result, StashEntry};
use async_trait::async_trait;

/// Durable buffer of early arrivals
#[async_trait]
pub trait Stash: Send + Sync {
    /// Store an entry; no-op returning `false` if one already exists
    async fn insert(&self, key: &PartitionKey, seq: u64, blob: &[u8]) -> Result<bool>;

    /// Point lookup
    async fn get(&self, key: &PartitionKey, seq: u64) -> Result<Option<Vec<u8>>>;

    /// Entries with `from <= seq <= to`, ascending
    async fn range_query(&self, key: &PartitionKey, from: u64, to: u64) -> Result<Vec<StashEntry>>;

    /// Remove an entry (no-op if absent)
    async fn delete(&self, key: &PartitionKey, seq: u64) -> Result<()>;

    /// Number of entries for a key
    async fn count(&self, key: &PartitionKey) -> Result<u64>;
}

/// Counter store and stash backed by the same storage
#[async_trait]
pub trait SequencerStore: SequenceCounterStore + Stash {
    /// Advance the pointer past a drained entry and delete that entry
    ///
    /// `expected` is the pointer value the entry was drained at, which is
    /// also its sequence number. Backends that can do both in one atomic
    /// write should override this.
    async fn release_stashed(&self, key: &PartitionKey, expected: u64) -> Result<u64> {
        let next = self.compare_and_advance(key, expected).await?;
        self.delete(key, expected).await?;
        Ok(next)
    }
}
