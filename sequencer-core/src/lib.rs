//! Lunar Sequencer Core
//!
//! Per-partition ordering engine: numbered messages arrive on a shared log
//! in any order and leave, per partition key, in strictly increasing and
//! gap-free order.
//!
//! # Architecture
//!
//! - **Gateway**: validates and appends messages, never waits for processing
//! - **Engine**: classifies each entry against the key's pointer, stashes
//!   early arrivals and drains them once the gap closes
//! - **Worker**: consumer-group read loop with cooperative shutdown
//! - **Storage**: RocksDB counters, stash and dead letters
//!
//! # Invariants
//!
//! - Per key, deliveries are strictly increasing and never skip a number
//! - A delivered `(key, n)` is never delivered again by a later duplicate
//! - A message is dead-lettered at most once, after its retry budget

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod counter;
pub mod dead_letter;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod locks;
pub mod log;
pub mod memory;
pub mod metrics;
pub mod stash;
pub mod storage;
pub mod types;
pub mod worker;

// Re-exports
pub use config::{BackoffConfig, DeadLetterTarget, LogFormat, PublishConfig, SequencerConfig};
pub use counter::SequenceCounterStore;
pub use dead_letter::{is_reprocessable, replay, DeadLetterSink};
pub use delivery::{ChannelSink, FnSink, OrderedSink};
pub use engine::{OrderingEngine, Outcome};
pub use error::{Error, Result};
pub use gateway::Gateway;
pub use log::{Acknowledge, AppendLog, GroupReader, LogEntry};
pub use memory::{MemoryLog, MemoryReader, MemoryStore};
pub use metrics::Metrics;
pub use stash::{SequencerStore, Stash};
pub use storage::{Storage, StorageStats};
pub use types::{
    DeadLetterPayload, DeadLetterRecord, LogOffset, NextSequencePointer, PartitionKey, Receipt,
    SequencedMessage, StashEntry,
};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats};
