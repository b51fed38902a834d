//! Dead-letter sink
//!
//! Pure append for operator inspection and replay. The engine writes here
//! and never reads back.

use crate::{
    log::AppendLog, DeadLetterPayload, DeadLetterRecord, Error, Receipt, Result,
};
use async_trait::async_trait;
use bytes::Bytes;

/// Terminal storage for messages that exceeded the retry budget
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Append a record
    async fn record(&self, record: DeadLetterRecord) -> Result<()>;

    /// Oldest-first enumeration, at most `limit` records
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterRecord>>;
}

/// Reasons that point at a transient cause worth replaying
pub fn is_reprocessable(reason: &str) -> bool {
    let transient_errors = [
        "timeout",
        "connection_refused",
        "service_unavailable",
        "rate_limit",
        "temporary",
        "delivery",
        "storage",
    ];

    let reason = reason.to_lowercase();
    transient_errors.iter().any(|err| reason.contains(err))
}

/// Re-append a dead-lettered message with its retry budget reset
///
/// Records that hold raw bytes cannot be replayed. The append is keyed by
/// the record id, so it never collides with the original publish, and a
/// second replay of the same record inside the log's dedup window is
/// reported as an error. The replayed copy goes through normal
/// classification, so it is discarded if its number was delivered in the
/// meantime.
pub async fn replay(record: &DeadLetterRecord, log: &dyn AppendLog) -> Result<Receipt> {
    match &record.original {
        DeadLetterPayload::Message(message) => {
            let mut fresh = message.clone();
            fresh.retry_count = 0;
            let bytes = Bytes::from(fresh.to_bytes()?);
            let dedup_id = format!("replay-{}", record.id);
            let receipt = log.append_with_id(&fresh.key, bytes, &dedup_id).await?;
            if receipt.duplicate {
                return Err(Error::InvalidMessage(format!(
                    "dead letter {} was already replayed",
                    record.id
                )));
            }
            tracing::info!(
                id = %record.id,
                key = %fresh.key,
                seq = fresh.message_number,
                "Replayed dead letter"
            );
            Ok(receipt)
        }
        DeadLetterPayload::Raw(_) => Err(Error::InvalidMessage(format!(
            "dead letter {} holds undecodable bytes",
            record.id
        ))),
    }
}
