//! Consumer-group reader over a durable pull consumer

use crate::{metrics::BusMetrics, Error, JetStreamManager, Result};
use async_nats::jetstream::{self, consumer::PullConsumer};
use async_trait::async_trait;
use futures::StreamExt;
use sequencer_core::{Acknowledge, GroupReader, LogEntry, LogOffset};
use std::time::Duration;
use tracing::{debug, warn};

/// [`GroupReader`] for one partition of the incoming stream
///
/// Readers built for the same partition share the durable consumer and
/// compete for its entries.
pub struct JetStreamReader {
    name: String,
    stream: String,
    consumer: PullConsumer,
    metrics: BusMetrics,
}

impl std::fmt::Debug for JetStreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JetStreamReader")
            .field("name", &self.name)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl JetStreamReader {
    /// Bind a reader to `partition`
    ///
    /// `worker` names this reader in logs; the broker-side identity is the
    /// partition's durable consumer.
    pub async fn bind(
        manager: &JetStreamManager,
        stream: &str,
        partition: u32,
        worker: &str,
    ) -> Result<Self> {
        let consumer = manager.partition_consumer(partition).await?;
        Ok(Self {
            name: format!("{}/{}", worker, manager.consumer_name(partition)),
            stream: stream.to_string(),
            consumer,
            metrics: BusMetrics::new()?,
        })
    }

    /// Receive metrics
    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }
}

#[async_trait]
impl GroupReader for JetStreamReader {
    fn consumer(&self) -> &str {
        &self.name
    }

    async fn read(&mut self, max: usize, block: Duration) -> sequencer_core::Result<Vec<LogEntry>> {
        let mut batch = self
            .consumer
            .batch()
            .max_messages(max)
            .expires(block)
            .messages()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;

        let mut entries = Vec::with_capacity(max);
        while let Some(message) = batch.next().await {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    if entries.is_empty() {
                        return Err(Error::Fetch(e.to_string()).into());
                    }
                    // Keep what arrived; the rest is redelivered after ack wait
                    warn!(consumer = %self.name, error = %e, "Batch ended early");
                    break;
                }
            };

            let (offset, delivery) = match message.info() {
                Ok(info) => (info.stream_sequence, info.delivered.max(1) as u32),
                Err(e) => {
                    self.metrics
                        .receive_total
                        .with_label_values(&[self.stream.as_str(), "invalid"])
                        .inc();
                    warn!(consumer = %self.name, error = %e, "Message without JetStream metadata");
                    continue;
                }
            };

            self.metrics
                .receive_total
                .with_label_values(&[self.stream.as_str(), "success"])
                .inc();

            let payload = message.payload.clone();
            entries.push(LogEntry::new(
                LogOffset(offset),
                payload,
                delivery,
                Box::new(JetStreamAck { message }),
            ));
        }

        if !entries.is_empty() {
            debug!(consumer = %self.name, entries = entries.len(), "Fetched batch");
        }
        Ok(entries)
    }
}

struct JetStreamAck {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledge for JetStreamAck {
    async fn ack(self: Box<Self>) -> sequencer_core::Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| Error::Ack(e.to_string()).into())
    }

    async fn release(self: Box<Self>) -> sequencer_core::Result<()> {
        // Negative acknowledgment (will be redelivered)
        self.message
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| Error::Ack(e.to_string()).into())
    }
}
