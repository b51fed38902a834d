//! Ordering engine
//!
//! Turns log entries that arrive in any order into per-key, gap-free,
//! strictly increasing deliveries.
//!
//! # Classification
//!
//! For a message `n` on key `k` with pointer `next`:
//!
//! - `n < next`: already delivered, discard
//! - `n == next`: deliver, advance, then drain the stash from `next + 1`
//! - `n > next`: stash, then drain from `next` in case an earlier drain
//!   stopped on a store error
//!
//! The whole classify-act sequence for a key runs under that key's lock.
//! The pointer advance is conditional, so a caller that lost a race is
//! reported as [`Error::PointerConflict`] and never skips or repeats.
//!
//! # Durability boundary
//!
//! Delivery happens before the pointer advance. A crash between the two
//! re-delivers that one message after restart, so the downstream sink must
//! tolerate a repeat of the last message per key. A store error on the
//! advance itself has the same effect: the message is retried (or drained
//! again later) and delivered a second time.
//!
//! # Failures
//!
//! A delivery failure, whether in order or while draining, spends one unit
//! of the message's retry budget: the stash entry (if any) is replaced by a
//! re-appended copy with a higher retry count. Failures that are not
//! retryable go to the dead-letter sink at once.

use crate::{
    dead_letter::DeadLetterSink,
    delivery::OrderedSink,
    locks::KeyLocks,
    log::{AppendLog, LogEntry},
    metrics::Metrics,
    stash::SequencerStore,
    DeadLetterRecord, Error, LogOffset, PartitionKey, Result, SequencedMessage,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Stale or duplicate, dropped
    Discarded,

    /// Delivered in order, followed by `drained` stashed successors
    Emitted {
        /// Stash entries released after this one
        drained: u64,
    },

    /// Stored for later; `drained` entries were released by the self-heal drain
    Stashed {
        /// Stash entries released while handling this one
        drained: u64,
    },

    /// Failed and re-appended with a higher retry count
    Retried {
        /// Retry count carried by the re-appended copy
        retry_count: u32,
    },

    /// Moved to the dead-letter sink
    DeadLettered,

    /// Could not be settled; handed back to the log for redelivery
    Abandoned,
}

/// Per-key ordering state machine
pub struct OrderingEngine {
    store: Arc<dyn SequencerStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    log: Arc<dyn AppendLog>,
    sink: Arc<dyn OrderedSink>,
    locks: KeyLocks,
    max_retries: u32,
    metrics: Metrics,
}

impl std::fmt::Debug for OrderingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderingEngine")
            .field("max_retries", &self.max_retries)
            .field("active_keys", &self.locks.active())
            .finish_non_exhaustive()
    }
}

impl OrderingEngine {
    /// Create engine
    ///
    /// `log` is the same log the entries are read from; failed entries are
    /// re-appended to it with an incremented retry count.
    pub fn new(
        store: Arc<dyn SequencerStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
        log: Arc<dyn AppendLog>,
        sink: Arc<dyn OrderedSink>,
        max_retries: u32,
    ) -> Result<Self> {
        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("metrics registry: {}", e)))?;

        Ok(Self {
            store,
            dead_letters,
            log,
            sink,
            locks: KeyLocks::new(),
            max_retries,
            metrics,
        })
    }

    /// Engine metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Retry budget per message
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Process one entry and settle it with the log
    ///
    /// The entry is acknowledged unless the outcome is
    /// [`Outcome::Abandoned`], in which case it is released for redelivery.
    pub async fn process(&self, entry: LogEntry) -> Outcome {
        let _timer = self.metrics.process_duration.start_timer();
        let offset = entry.offset;

        let message = match decode(&entry.payload) {
            Ok(message) => message,
            Err(reason) => {
                let record =
                    DeadLetterRecord::for_raw(entry.payload.to_vec(), reason, Some(offset));
                let result = self.dead_letter(record).await.map(|_| Outcome::DeadLettered);
                return settle(entry, result).await;
            }
        };

        let result = {
            let _guard = self.locks.lock(&message.key).await;
            self.sequence(&message).await
        };

        let result = match result {
            Ok(outcome) => Ok(outcome),
            Err(err @ Error::PointerConflict { .. }) => {
                self.metrics.conflicts_total.inc();
                Err(err)
            }
            Err(err) => self.handle_failure(message, err, Some(offset)).await,
        };

        settle(entry, result).await
    }

    async fn sequence(&self, message: &SequencedMessage) -> Result<Outcome> {
        let key = &message.key;
        let n = message.message_number;
        let next = self.store.get_or_init(key).await?;

        if n < next {
            self.metrics.duplicates_total.inc();
            debug!(key = %key, seq = n, next, "Discarding duplicate");
            return Ok(Outcome::Discarded);
        }

        if n == next {
            self.sink.deliver(message).await?;
            self.store.compare_and_advance(key, next).await?;
            self.metrics.emitted_total.inc();
            debug!(key = %key, seq = n, "Emitted in order");

            let drained = self.drain(key, next + 1).await;
            return Ok(Outcome::Emitted { drained });
        }

        let blob = message.to_bytes()?;
        if self.store.insert(key, n, &blob).await? {
            self.metrics.stashed_total.inc();
            debug!(key = %key, seq = n, next, "Stashed out-of-order message");
        } else {
            debug!(key = %key, seq = n, "Already stashed");
        }

        let drained = self.drain(key, next).await;
        Ok(Outcome::Stashed { drained })
    }

    /// Release consecutive stash entries starting at `from`
    ///
    /// Stops at the first gap or failure. Failures never propagate: the
    /// message that triggered the drain has already been settled.
    async fn drain(&self, key: &PartitionKey, from: u64) -> u64 {
        let mut pointer = from;
        let mut drained = 0;

        loop {
            let blob = match self.store.get(key, pointer).await {
                Ok(Some(blob)) => blob,
                Ok(None) => break,
                Err(err) => {
                    warn!(key = %key, seq = pointer, error = %err, "Drain stopped: stash read failed");
                    break;
                }
            };

            let message = match SequencedMessage::from_bytes(&blob) {
                Ok(message) => message,
                Err(err) => {
                    let reason = format!("unparseable_stash_entry: {}", err);
                    let record = DeadLetterRecord::for_raw(blob, reason, None);
                    match self.dead_letter(record).await {
                        Ok(()) => {
                            if let Err(err) = self.store.delete(key, pointer).await {
                                warn!(key = %key, seq = pointer, error = %err, "Failed to remove dead-lettered stash entry");
                            }
                        }
                        Err(err) => {
                            error!(key = %key, seq = pointer, error = %err, "Failed to dead-letter stash entry");
                        }
                    }
                    break;
                }
            };

            if let Err(err) = self.sink.deliver(&message).await {
                warn!(key = %key, seq = pointer, error = %err, "Drain stopped: delivery failed");
                match self.handle_failure(message, err, None).await {
                    Ok(outcome) => {
                        debug!(key = %key, seq = pointer, ?outcome, "Stashed message handed off");
                        if let Err(err) = self.store.delete(key, pointer).await {
                            warn!(key = %key, seq = pointer, error = %err, "Failed to remove handed-off stash entry");
                        }
                    }
                    Err(err) => {
                        error!(key = %key, seq = pointer, error = %err, "Failed to hand off stashed message, kept in stash");
                    }
                }
                break;
            }

            match self.store.release_stashed(key, pointer).await {
                Ok(next) => {
                    pointer = next;
                    drained += 1;
                    self.metrics.emitted_total.inc();
                    self.metrics.drained_total.inc();
                }
                Err(err) => {
                    if matches!(err, Error::PointerConflict { .. }) {
                        self.metrics.conflicts_total.inc();
                    }
                    error!(key = %key, seq = pointer, error = %err, "Drain stopped: pointer advance failed");
                    break;
                }
            }
        }

        if drained > 0 {
            info!(key = %key, drained, next = pointer, "Drained stash");
        }
        drained
    }

    async fn handle_failure(
        &self,
        message: SequencedMessage,
        err: Error,
        offset: Option<LogOffset>,
    ) -> Result<Outcome> {
        if !err.is_retryable() {
            let reason = format!("non_retryable: {}", err);
            let record = DeadLetterRecord::for_message(message, reason, offset);
            self.dead_letter(record).await?;
            return Ok(Outcome::DeadLettered);
        }

        if message.retry_count < self.max_retries {
            let retry = message.with_retry();
            let bytes = Bytes::from(retry.to_bytes()?);
            self.log.append(&retry.key, bytes).await?;
            self.metrics.retried_total.inc();

            warn!(
                key = %retry.key,
                seq = retry.message_number,
                retry_count = retry.retry_count,
                max_retries = self.max_retries,
                error = %err,
                "Processing failed, re-appended for retry"
            );
            return Ok(Outcome::Retried {
                retry_count: retry.retry_count,
            });
        }

        let reason = format!("max_retries_exceeded: {}", err);
        let record = DeadLetterRecord::for_message(message, reason, offset);
        self.dead_letter(record).await?;
        Ok(Outcome::DeadLettered)
    }

    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        let key = record.key().map(|k| k.to_string()).unwrap_or_default();
        let reason = record.reason.clone();
        let retry_count = record.retry_count;

        self.dead_letters.record(record).await?;
        self.metrics.dead_lettered_total.inc();

        error!(key = %key, retry_count, reason = %reason, "Message dead-lettered");
        Ok(())
    }
}

fn decode(payload: &[u8]) -> std::result::Result<SequencedMessage, &'static str> {
    if payload.is_empty() {
        return Err("empty_payload");
    }
    let message = SequencedMessage::from_bytes(payload).map_err(|_| "unparseable_payload")?;
    if message.message_number == 0 {
        return Err("invalid_message_number");
    }
    Ok(message)
}

async fn settle(entry: LogEntry, result: Result<Outcome>) -> Outcome {
    let offset = entry.offset;
    match result {
        Ok(outcome) => {
            if let Err(err) = entry.ack().await {
                warn!(offset = %offset, error = %err, "Failed to acknowledge entry");
            }
            outcome
        }
        Err(err) => {
            error!(offset = %offset, error = %err, "Entry not settled, releasing for redelivery");
            if let Err(err) = entry.release().await {
                warn!(offset = %offset, error = %err, "Failed to release entry");
            }
            Outcome::Abandoned
        }
    }
}
