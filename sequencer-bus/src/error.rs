//! Error types for the bus backend

use thiserror::Error;

/// Bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish error
    #[error("Publish error: {0}")]
    Publish(String),

    /// Stream could not be created or looked up
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer could not be created
    #[error("Consumer error: {0}")]
    ConsumerCreation(String),

    /// Pull request failed
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Acknowledgement failed
    #[error("Ack error: {0}")]
    Ack(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for sequencer_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Serialization(e) => sequencer_core::Error::Serialization(e),
            Error::Metrics(e) => sequencer_core::Error::Config(e.to_string()),
            other => sequencer_core::Error::Log(other.to_string()),
        }
    }
}
