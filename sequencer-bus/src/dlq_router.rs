//! Dead Letter Queue router
//!
//! Publishes dead-letter records to the dead-letter stream with:
//! - Partition-affine subjects (`<prefix>.<partition>`, `<prefix>.unkeyed`
//!   for payloads that never decoded)
//! - Record ID as the broker deduplication key
//! - Oldest-first listing through an ephemeral consumer

use async_nats::jetstream::{consumer, Context as JetStreamContext};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use sequencer_core::{is_reprocessable, DeadLetterRecord, DeadLetterSink, SequencerConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::{
    partitioning::{partition_subject, HashPartitioning, PartitioningStrategy},
    publisher::{publish_with_retry, PublisherConfig},
    Error, NatsClient, Result,
};

/// Subject token for records without a key
const UNKEYED: &str = "unkeyed";

/// DLQ Router
#[derive(Debug, Clone)]
pub struct DlqRouter {
    context: JetStreamContext,
    stream_name: String,
    subject_prefix: String,
    partitioning: HashPartitioning,
    publisher: PublisherConfig,
}

impl DlqRouter {
    /// Create new DLQ router
    pub fn new(client: &NatsClient, config: &SequencerConfig) -> Self {
        Self {
            context: client.jetstream().clone(),
            stream_name: config.dead_letter_stream.clone(),
            subject_prefix: config.dead_letter_subject_prefix.clone(),
            partitioning: HashPartitioning::new(config.num_partitions),
            publisher: PublisherConfig::from(&config.publish),
        }
    }

    /// Subject a record is published on
    pub fn subject_for(&self, record: &DeadLetterRecord) -> String {
        match record.key() {
            Some(key) => partition_subject(&self.subject_prefix, self.partitioning.partition(key)),
            None => format!("{}.{}", self.subject_prefix, UNKEYED),
        }
    }

    /// Route record to DLQ
    pub async fn route_to_dlq(&self, record: &DeadLetterRecord) -> Result<u64> {
        let subject = self.subject_for(record);
        let payload = Bytes::from(serde_json::to_vec(record)?);

        let ack = publish_with_retry(
            &self.context,
            &self.publisher,
            &subject,
            &record.id.to_string(),
            payload,
        )
        .await?;

        info!(
            id = %record.id,
            subject = %subject,
            sequence = ack.sequence,
            reason = %record.reason,
            "Record routed to dead-letter stream"
        );
        Ok(ack.sequence)
    }

    /// Oldest-first records without consuming them
    pub async fn list_entries(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let stream = self
            .context
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| Error::Stream(e.to_string()))?;

        // Ephemeral and unacknowledged, so listing leaves the stream untouched
        let reader = stream
            .create_consumer(consumer::pull::Config {
                deliver_policy: consumer::DeliverPolicy::All,
                ack_policy: consumer::AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::ConsumerCreation(e.to_string()))?;

        let mut messages = reader
            .fetch()
            .max_messages(limit)
            .messages()
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?;

        let mut records = Vec::new();
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| Error::Fetch(e.to_string()))?;
            match serde_json::from_slice::<DeadLetterRecord>(&message.payload) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping undecodable dead-letter record: {}", e),
            }
        }
        Ok(records)
    }

    /// Get DLQ statistics over the oldest `limit` records
    pub async fn get_stats(&self, limit: usize) -> Result<DlqStats> {
        let records = self.list_entries(limit).await?;
        Ok(DlqStats::from_records(&records))
    }
}

#[async_trait]
impl DeadLetterSink for DlqRouter {
    async fn record(&self, record: DeadLetterRecord) -> sequencer_core::Result<()> {
        match self.route_to_dlq(&record).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(id = %record.id, "Failed to route record to dead-letter stream: {}", e);
                Err(e.into())
            }
        }
    }

    async fn list(&self, limit: usize) -> sequencer_core::Result<Vec<DeadLetterRecord>> {
        Ok(self.list_entries(limit).await?)
    }
}

/// DLQ statistics
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DlqStats {
    /// Records inspected
    pub total_entries: usize,
    /// Records whose reason looks transient
    pub reprocessable: usize,
    /// Count per reason (text before the first `:`)
    pub by_reason: HashMap<String, usize>,
}

impl DlqStats {
    /// Aggregate a set of records
    pub fn from_records(records: &[DeadLetterRecord]) -> Self {
        let mut stats = Self {
            total_entries: records.len(),
            ..Default::default()
        };
        for record in records {
            if is_reprocessable(&record.reason) {
                stats.reprocessable += 1;
            }
            let reason = record
                .reason
                .split(':')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
            *stats.by_reason.entry(reason).or_insert(0) += 1;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sequencer_core::SequencedMessage;
    use serde_json::json;

    #[test]
    fn test_stats_from_records() {
        let message = SequencedMessage::new("A", 1, "T", Utc::now(), json!({}));
        let records = vec![
            DeadLetterRecord::for_message(
                message.clone(),
                "max_retries_exceeded: Delivery error: downstream timeout",
                None,
            ),
            DeadLetterRecord::for_message(message, "max_retries_exceeded: Invalid message: bad", None),
            DeadLetterRecord::for_raw(b"{".to_vec(), "unparseable_payload", None),
        ];

        let stats = DlqStats::from_records(&records);
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.reprocessable, 1);
        assert_eq!(stats.by_reason.get("max_retries_exceeded"), Some(&2));
        assert_eq!(stats.by_reason.get("unparseable_payload"), Some(&1));
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_route_and_list() {
        let client = NatsClient::connect("nats://localhost:4222").await.unwrap();
        let run = uuid::Uuid::new_v4().simple().to_string();
        let config = SequencerConfig {
            incoming_stream: format!("TEST_IN_{}", run),
            dead_letter_stream: format!("TEST_DL_{}", run),
            subject_prefix: format!("test.{}.incoming", run),
            dead_letter_subject_prefix: format!("test.{}.dead-letters", run),
            ..Default::default()
        };
        crate::JetStreamManager::new(&client, &config)
            .init_streams()
            .await
            .unwrap();

        let router = DlqRouter::new(&client, &config);
        let raw = DeadLetterRecord::for_raw(b"oops".to_vec(), "unparseable_payload", None);
        assert!(router.subject_for(&raw).ends_with(".unkeyed"));
        router.record(raw.clone()).await.unwrap();

        let listed = router.list(10).await.unwrap();
        assert_eq!(listed, vec![raw]);
    }
}
