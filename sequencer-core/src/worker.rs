//! Consume loop
//!
//! A worker owns one [`GroupReader`] and feeds its batches through a shared
//! [`OrderingEngine`], one entry at a time in read order. Several workers
//! may share one engine; the engine serializes work per key.
//!
//! Shutdown is cooperative: the worker stops pulling, finishes the entry in
//! flight and hands the rest of the batch back to the log.

use crate::{
    config::{BackoffConfig, SequencerConfig},
    engine::{OrderingEngine, Outcome},
    log::{GroupReader, LogEntry},
    Error, Result,
};
use backoff::backoff::Backoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Worker loop settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Max entries per read
    pub batch_size: usize,

    /// How long a read may block
    pub block_timeout: Duration,

    /// Delay policy after read failures and unsettled entries
    pub backoff: BackoffConfig,
}

impl From<&SequencerConfig> for WorkerConfig {
    fn from(config: &SequencerConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            block_timeout: config.block_timeout(),
            backoff: config.backoff.clone(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&SequencerConfig::default())
    }
}

/// Counters accumulated by one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Entries taken from the log and processed
    pub processed: u64,
    /// Messages delivered downstream (in order plus drained)
    pub emitted: u64,
    /// Duplicates dropped
    pub discarded: u64,
    /// Messages stashed
    pub stashed: u64,
    /// Entries re-appended for retry
    pub retried: u64,
    /// Entries dead-lettered
    pub dead_lettered: u64,
    /// Entries released unsettled
    pub abandoned: u64,
    /// Failed reads
    pub read_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Discarded => self.discarded += 1,
            Outcome::Emitted { drained } => self.emitted += 1 + drained,
            Outcome::Stashed { drained } => {
                self.stashed += 1;
                self.emitted += drained;
            }
            Outcome::Retried { .. } => self.retried += 1,
            Outcome::DeadLettered => self.dead_lettered += 1,
            Outcome::Abandoned => self.abandoned += 1,
        }
    }
}

impl std::ops::AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.emitted += other.emitted;
        self.discarded += other.discarded;
        self.stashed += other.stashed;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.abandoned += other.abandoned;
        self.read_errors += other.read_errors;
    }
}

/// Spawns worker tasks
#[derive(Debug)]
pub struct Worker;

impl Worker {
    /// Start a worker task on the current runtime
    pub fn spawn<R>(engine: Arc<OrderingEngine>, reader: R, config: WorkerConfig) -> WorkerHandle
    where
        R: GroupReader + 'static,
    {
        let consumer = reader.consumer().to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(engine, reader, config, shutdown_rx));

        WorkerHandle {
            consumer,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Control handle for a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    consumer: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    /// Consumer identity of the worker
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Ask the worker to stop without waiting for it
    pub fn stop(&self) {
        // Receiver gone means the task already exited
        let _ = self.shutdown.send(true);
    }

    /// True once the task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the worker and wait for it to finish
    pub async fn shutdown(self) -> Result<WorkerStats> {
        self.stop();
        self.task
            .await
            .map_err(|e| Error::Concurrency(format!("worker {} failed: {}", self.consumer, e)))
    }
}

async fn run<R: GroupReader>(
    engine: Arc<OrderingEngine>,
    mut reader: R,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> WorkerStats {
    let consumer = reader.consumer().to_string();
    let mut stats = WorkerStats::default();
    let mut backoff = config.backoff.build();
    let max_delay = Duration::from_millis(config.backoff.max_interval_ms);

    info!(
        consumer = %consumer,
        batch_size = config.batch_size,
        block_ms = config.block_timeout.as_millis() as u64,
        "Worker started"
    );

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }

        let read = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            read = reader.read(config.batch_size, config.block_timeout) => read,
        };

        let batch = match read {
            Ok(batch) => {
                backoff.reset();
                batch
            }
            Err(e) => {
                stats.read_errors += 1;
                let delay = backoff.next_backoff().unwrap_or(max_delay);
                warn!(
                    consumer = %consumer,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Read failed, backing off"
                );
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        if batch.is_empty() {
            continue;
        }
        debug!(consumer = %consumer, entries = batch.len(), "Processing batch");

        let mut entries = batch.into_iter();
        while let Some(entry) = entries.next() {
            let outcome = engine.process(entry).await;
            stats.record(outcome);

            if *shutdown.borrow() {
                release_remaining(&consumer, entries).await;
                break 'outer;
            }

            if outcome == Outcome::Abandoned {
                let delay = backoff.next_backoff().unwrap_or(max_delay);
                tokio::select! {
                    _ = shutdown.changed() => {
                        release_remaining(&consumer, entries).await;
                        break 'outer;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    info!(
        consumer = %consumer,
        processed = stats.processed,
        emitted = stats.emitted,
        stashed = stats.stashed,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        "Worker stopped"
    );
    stats
}

async fn release_remaining(consumer: &str, entries: impl Iterator<Item = LogEntry>) {
    let mut released = 0;
    for rest in entries {
        match rest.release().await {
            Ok(()) => released += 1,
            Err(e) => warn!(consumer = %consumer, error = %e, "Failed to release entry"),
        }
    }
    if released > 0 {
        info!(consumer = %consumer, released, "Released unprocessed entries");
    }
}
