//! Sequencer Node Binary
//!
//! Consumes the owned partitions of the incoming stream and applies each
//! rocket channel's events in order.

use anyhow::Context;
use sequencer_bus::{DlqRouter, JetStreamLog, JetStreamManager, JetStreamReader, NatsClient};
use sequencer_core::{
    AppendLog, DeadLetterSink, DeadLetterTarget, OrderingEngine, SequencerConfig, Storage, Worker,
    WorkerConfig, WorkerStats,
};
use sequencer_node::{telemetry, RocketProjection};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::var("SEQUENCER_CONFIG").ok();
    let config = match &config_path {
        Some(path) => {
            let mut config = SequencerConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path))?;
            config.apply_env()?;
            config.validate()?;
            config
        }
        None => SequencerConfig::from_env()?,
    };

    telemetry::init(config.log_format);
    info!("Starting sequencer node");
    match &config_path {
        Some(path) => info!("Loaded config from: {}", path),
        None => info!("Loaded config from environment variables"),
    }

    info!("Opening storage at: {:?}", config.data_dir);
    let storage = Arc::new(Storage::open(&config)?);
    let stored = storage.get_stats()?;
    info!(
        keys = stored.total_keys,
        stashed = stored.total_stashed,
        dead_letters = stored.total_dead_letters,
        "Storage opened"
    );

    info!("Connecting to NATS at {}", config.nats_url);
    let client = NatsClient::connect(&config.nats_url).await?;
    let manager = JetStreamManager::new(&client, &config);
    manager.init_streams().await?;
    match manager.stream_depth(&config.incoming_stream).await {
        Ok(depth) => info!(stream = %config.incoming_stream, depth, "Incoming stream ready"),
        Err(e) => warn!("Failed to read incoming stream depth: {}", e),
    }

    let log: Arc<dyn AppendLog> = Arc::new(JetStreamLog::new(&client, &config)?);
    let dead_letters: Arc<dyn DeadLetterSink> = match config.dead_letter_target {
        DeadLetterTarget::Stream => Arc::new(DlqRouter::new(&client, &config)),
        DeadLetterTarget::Local => storage.clone(),
    };
    let projection = Arc::new(RocketProjection::new());

    let engine = Arc::new(OrderingEngine::new(
        storage.clone(),
        dead_letters,
        log,
        projection.clone(),
        config.max_retries,
    )?);

    let worker_config = WorkerConfig::from(&config);
    let mut workers = Vec::new();
    for partition in config.partitions() {
        let reader = JetStreamReader::bind(
            &manager,
            &config.incoming_stream,
            partition,
            &config.consumer_name,
        )
        .await?;
        workers.push(Worker::spawn(engine.clone(), reader, worker_config.clone()));
    }

    info!("Sequencer node running");
    info!("- Group: {}", config.consumer_group);
    info!("- Consumer: {}", config.consumer_name);
    info!("- Partitions: {:?}", config.partitions());
    info!("- Dead letters: {:?}", config.dead_letter_target);

    // Wait for shutdown signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    // Graceful shutdown
    info!("Shutting down sequencer node...");
    for worker in &workers {
        worker.stop();
    }

    let mut totals = WorkerStats::default();
    for worker in workers {
        let consumer = worker.consumer().to_string();
        match worker.shutdown().await {
            Ok(stats) => totals += stats,
            Err(e) => warn!(consumer = %consumer, "Worker did not stop cleanly: {}", e),
        }
    }

    if let Err(e) = storage.flush() {
        error!("Failed to flush storage: {}", e);
    }
    if let Err(e) = client.flush().await {
        warn!("Failed to flush NATS connection: {}", e);
    }

    info!(
        processed = totals.processed,
        emitted = totals.emitted,
        stashed = totals.stashed,
        retried = totals.retried,
        dead_lettered = totals.dead_lettered,
        rockets = projection.len(),
        "Sequencer node stopped"
    );
    Ok(())
}
