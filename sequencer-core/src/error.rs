//! Error types for the sequencer

use crate::types::PartitionKey;
use thiserror::Error;

/// Result type for sequencer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Sequencer errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Message rejected at the gateway
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Append log unreachable or rejected the operation
    #[error("Log error: {0}")]
    Log(String),

    /// Downstream consumer failed to accept a message
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// Downstream consumer refused a message it will never accept
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Conditional pointer advance observed a different value
    #[error("Pointer conflict for {key}: expected {expected}, found {actual}")]
    PointerConflict {
        /// Partition key
        key: PartitionKey,
        /// Value the caller classified against
        expected: u64,
        /// Value found in the store
        actual: u64,
    },

    /// Concurrency error (worker task gone, channel closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl Error {
    /// False for failures that cannot succeed on another attempt
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::Rejected(_) | Error::InvalidMessage(_))
    }
}
