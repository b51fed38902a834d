//! Ingestion gateway
//!
//! Accepts numbered messages from producers and appends them to the shared
//! log. Returns as soon as the append is durable; ordering happens later in
//! the engine.

use crate::{log::AppendLog, Error, PartitionKey, Receipt, Result, SequencedMessage};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Producer-facing publish API
#[derive(Clone)]
pub struct Gateway {
    log: Arc<dyn AppendLog>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    /// Create gateway over a log
    pub fn new(log: Arc<dyn AppendLog>) -> Self {
        Self { log }
    }

    /// Validate, serialize and append a message
    pub async fn publish(&self, message: &SequencedMessage) -> Result<Receipt> {
        if message.message_number == 0 {
            return Err(Error::InvalidMessage(format!(
                "message_number must be >= 1 (key {})",
                message.key
            )));
        }
        if message.retry_count != 0 {
            return Err(Error::InvalidMessage(format!(
                "retry_count is engine-managed, got {} (key {})",
                message.retry_count, message.key
            )));
        }

        let bytes = Bytes::from(message.to_bytes()?);
        let receipt = self.log.append(&message.key, bytes).await?;

        debug!(
            key = %message.key,
            seq = message.message_number,
            offset = %receipt.offset,
            duplicate = receipt.duplicate,
            "Published message"
        );

        Ok(receipt)
    }

    /// Build a message from its parts and publish it
    pub async fn publish_parts(
        &self,
        key: impl Into<PartitionKey>,
        message_number: u64,
        message_type: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Result<Receipt> {
        let message =
            SequencedMessage::new(key, message_number, message_type, occurred_at, payload);
        self.publish(&message).await
    }
}
