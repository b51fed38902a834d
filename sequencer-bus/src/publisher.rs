//! JetStream append log with retry logic

use crate::{
    client::NatsClient,
    metrics::BusMetrics,
    partitioning::{partition_subject, HashPartitioning, PartitioningStrategy},
    Error, Result,
};
use async_nats::jetstream::{publish::PublishAck, Context as JetStreamContext};
use async_trait::async_trait;
use bytes::Bytes;
use sequencer_core::{
    config::PublishConfig, AppendLog, LogOffset, PartitionKey, Receipt, SequencerConfig,
};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Max retry attempts
    pub max_retry_attempts: u32,

    /// Initial retry delay
    pub initial_retry_delay: Duration,

    /// Max retry delay
    pub max_retry_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::from(&PublishConfig::default())
    }
}

impl From<&PublishConfig> for PublisherConfig {
    fn from(config: &PublishConfig) -> Self {
        Self {
            max_retry_attempts: config.max_attempts.max(1),
            initial_retry_delay: Duration::from_millis(config.initial_retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }
}

/// Publish with exponential backoff retry
///
/// `msg_id` goes into the `Nats-Msg-Id` header so a retried publish that
/// did reach the server is recognised as a duplicate.
pub(crate) async fn publish_with_retry(
    context: &JetStreamContext,
    config: &PublisherConfig,
    subject: &str,
    msg_id: &str,
    payload: Bytes,
) -> Result<PublishAck> {
    let mut attempts = 0;
    let mut delay = config.initial_retry_delay;

    loop {
        attempts += 1;

        match publish_once(context, subject, msg_id, payload.clone()).await {
            Ok(ack) => {
                if attempts > 1 {
                    info!("Message published to {} after {} attempts", subject, attempts);
                }
                return Ok(ack);
            }
            Err(e) => {
                if attempts >= config.max_retry_attempts {
                    error!("Failed to publish to {} after {} attempts: {}", subject, attempts, e);
                    return Err(e);
                }

                warn!(
                    "Publish failed (attempt {}), retrying in {:?}: {}",
                    attempts, delay, e
                );
                tokio::time::sleep(delay).await;

                // Exponential backoff
                delay = (delay * 2).min(config.max_retry_delay);
            }
        }
    }
}

async fn publish_once(
    context: &JetStreamContext,
    subject: &str,
    msg_id: &str,
    payload: Bytes,
) -> Result<PublishAck> {
    let mut headers = async_nats::HeaderMap::new();
    headers.insert("Nats-Msg-Id", msg_id);

    context
        .publish_with_headers(subject.to_string(), headers, payload)
        .await
        .map_err(|e| Error::Publish(e.to_string()))?
        .await
        .map_err(|e| Error::Publish(format!("Publish ack failed: {}", e)))
}

/// Incoming log on a JetStream stream
///
/// Each append goes to `<subject_prefix>.<partition>` where the partition
/// is derived from the key.
#[derive(Debug, Clone)]
pub struct JetStreamLog {
    context: JetStreamContext,
    stream: String,
    subject_prefix: String,
    partitioning: HashPartitioning,
    config: PublisherConfig,
    metrics: BusMetrics,
}

impl JetStreamLog {
    /// Create log over the incoming stream
    pub fn new(client: &NatsClient, config: &SequencerConfig) -> Result<Self> {
        Ok(Self {
            context: client.jetstream().clone(),
            stream: config.incoming_stream.clone(),
            subject_prefix: config.subject_prefix.clone(),
            partitioning: HashPartitioning::new(config.num_partitions),
            config: PublisherConfig::from(&config.publish),
            metrics: BusMetrics::new()?,
        })
    }

    /// Subject a key's messages are published on
    pub fn subject_for(&self, key: &PartitionKey) -> String {
        partition_subject(&self.subject_prefix, self.partitioning.partition(key))
    }

    /// Publish metrics
    pub fn metrics(&self) -> &BusMetrics {
        &self.metrics
    }
}

impl JetStreamLog {
    async fn publish(
        &self,
        key: &PartitionKey,
        payload: Bytes,
        msg_id: &str,
    ) -> sequencer_core::Result<Receipt> {
        let start = Instant::now();
        let subject = self.subject_for(key);

        let result =
            publish_with_retry(&self.context, &self.config, &subject, msg_id, payload).await;

        self.metrics
            .publish_duration
            .with_label_values(&[self.stream.as_str()])
            .observe(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .publish_total
            .with_label_values(&[self.stream.as_str(), status])
            .inc();

        let ack = result?;
        debug!(key = %key, subject = %subject, sequence = ack.sequence, "Appended to stream");

        Ok(Receipt {
            stream: ack.stream,
            offset: LogOffset(ack.sequence),
            duplicate: ack.duplicate,
        })
    }
}

#[async_trait]
impl AppendLog for JetStreamLog {
    async fn append(&self, key: &PartitionKey, payload: Bytes) -> sequencer_core::Result<Receipt> {
        let msg_id = blake3::hash(&payload).to_hex().to_string();
        self.publish(key, payload, &msg_id).await
    }

    async fn append_with_id(
        &self,
        key: &PartitionKey,
        payload: Bytes,
        dedup_id: &str,
    ) -> sequencer_core::Result<Receipt> {
        self.publish(key, payload, dedup_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_config_default() {
        let config = PublisherConfig::default();
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.initial_retry_delay, Duration::from_millis(100));
        assert_eq!(config.max_retry_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_attempts_still_publishes_once() {
        let config = PublisherConfig::from(&PublishConfig {
            max_attempts: 0,
            ..Default::default()
        });
        assert_eq!(config.max_retry_attempts, 1);
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_append_is_acknowledged() {
        let client = NatsClient::connect("nats://localhost:4222").await.unwrap();
        let config = SequencerConfig::default();
        crate::JetStreamManager::new(&client, &config)
            .init_streams()
            .await
            .unwrap();

        let log = JetStreamLog::new(&client, &config).unwrap();
        let key = PartitionKey::new("rocket-1");
        let payload = Bytes::from(uuid::Uuid::new_v4().to_string());

        let first = log.append(&key, payload.clone()).await.unwrap();
        let again = log.append(&key, payload).await.unwrap();
        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(first.offset, again.offset);
    }
}
