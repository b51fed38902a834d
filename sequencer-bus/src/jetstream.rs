//! JetStream stream and consumer setup
//!
//! - Incoming stream: work-queue retention, one subject per partition
//! - Dead-letter stream: limits retention, kept for inspection and replay
//! - One durable pull consumer per (group, partition)

use async_nats::jetstream::{
    consumer::{self, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    Context as JetStreamContext,
};
use sequencer_core::SequencerConfig;
use std::time::Duration;
use tracing::{error, info};

use crate::{
    partitioning::{all_partitions, partition_subject},
    Error, NatsClient, Result,
};

/// How long an unacknowledged entry stays with its consumer
pub const ACK_WAIT: Duration = Duration::from_secs(30);

/// Stream and consumer manager
#[derive(Debug, Clone)]
pub struct JetStreamManager {
    context: JetStreamContext,
    incoming_stream: String,
    dead_letter_stream: String,
    subject_prefix: String,
    dead_letter_subject_prefix: String,
    consumer_group: String,
    duplicate_window: Duration,
}

impl JetStreamManager {
    /// Create manager from sequencer settings
    pub fn new(client: &NatsClient, config: &SequencerConfig) -> Self {
        Self {
            context: client.jetstream().clone(),
            incoming_stream: config.incoming_stream.clone(),
            dead_letter_stream: config.dead_letter_stream.clone(),
            subject_prefix: config.subject_prefix.clone(),
            dead_letter_subject_prefix: config.dead_letter_subject_prefix.clone(),
            consumer_group: config.consumer_group.clone(),
            duplicate_window: Duration::from_secs(config.publish.duplicate_window_secs),
        }
    }

    /// JetStream context
    pub fn context(&self) -> &JetStreamContext {
        &self.context
    }

    /// Create both streams if missing
    pub async fn init_streams(&self) -> Result<()> {
        self.create_incoming_stream().await?;
        self.create_dead_letter_stream().await?;
        info!("JetStream streams initialized successfully");
        Ok(())
    }

    async fn create_incoming_stream(&self) -> Result<()> {
        let config = StreamConfig {
            name: self.incoming_stream.clone(),
            description: Some("Unordered incoming sequenced messages".to_string()),
            subjects: vec![all_partitions(&self.subject_prefix)],
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(7 * 24 * 3600), // 7 days
            storage: StorageType::File,
            duplicate_window: self.duplicate_window,
            ..Default::default()
        };
        self.ensure_stream(config).await
    }

    async fn create_dead_letter_stream(&self) -> Result<()> {
        let config = StreamConfig {
            name: self.dead_letter_stream.clone(),
            description: Some("Dead letters for failed sequenced messages".to_string()),
            subjects: vec![all_partitions(&self.dead_letter_subject_prefix)],
            retention: RetentionPolicy::Limits,
            max_messages: 1_000_000,
            max_age: Duration::from_secs(30 * 24 * 3600), // 30 days
            storage: StorageType::File,
            ..Default::default()
        };
        self.ensure_stream(config).await
    }

    async fn ensure_stream(&self, config: StreamConfig) -> Result<()> {
        let name = config.name.clone();
        info!("Creating stream: {} with subjects: {:?}", name, config.subjects);

        match self.context.get_or_create_stream(config).await {
            Ok(_) => {
                info!("Stream {} ready", name);
                Ok(())
            }
            Err(e) => {
                error!("Failed to create stream {}: {}", name, e);
                Err(Error::Stream(e.to_string()))
            }
        }
    }

    /// Durable consumer name for a partition
    pub fn consumer_name(&self, partition: u32) -> String {
        format!("{}-p{}", self.consumer_group, partition)
    }

    /// Durable pull consumer bound to one partition subject
    ///
    /// Redelivery is unlimited; retry budgets live in the messages.
    pub async fn partition_consumer(&self, partition: u32) -> Result<PullConsumer> {
        let name = self.consumer_name(partition);
        let filter_subject = partition_subject(&self.subject_prefix, partition);

        let stream = self
            .context
            .get_stream(&self.incoming_stream)
            .await
            .map_err(|e| Error::Stream(e.to_string()))?;

        let consumer_config = consumer::pull::Config {
            durable_name: Some(name.clone()),
            description: Some(format!("Sequencer partition {}", partition)),
            filter_subject: filter_subject.clone(),
            ack_policy: consumer::AckPolicy::Explicit,
            ack_wait: ACK_WAIT,
            max_deliver: -1,
            deliver_policy: consumer::DeliverPolicy::All,
            replay_policy: consumer::ReplayPolicy::Instant,
            ..Default::default()
        };

        let consumer = stream
            .get_or_create_consumer(&name, consumer_config)
            .await
            .map_err(|e| Error::ConsumerCreation(e.to_string()))?;

        info!(consumer = %name, subject = %filter_subject, "Partition consumer ready");
        Ok(consumer)
    }

    /// Messages currently held by a stream
    pub async fn stream_depth(&self, stream_name: &str) -> Result<u64> {
        let mut stream = self
            .context
            .get_stream(stream_name)
            .await
            .map_err(|e| Error::Stream(e.to_string()))?;
        let info = stream
            .info()
            .await
            .map_err(|e| Error::Stream(e.to_string()))?;
        Ok(info.state.messages)
    }
}
