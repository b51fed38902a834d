//! End-to-end pipeline over the in-memory log and RocksDB storage

use chrono::Utc;
use sequencer_core::{
    AppendLog, BackoffConfig, DeadLetterPayload, DeadLetterSink, Gateway, MemoryLog,
    OrderingEngine, SequencerConfig, Storage, Worker, WorkerConfig,
};
use sequencer_node::{RocketProjection, RocketStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn worker_config() -> WorkerConfig {
    WorkerConfig {
        batch_size: 4,
        block_timeout: Duration::from_millis(10),
        backoff: BackoffConfig {
            initial_interval_ms: 5,
            max_interval_ms: 20,
            multiplier: 2.0,
        },
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline did not settle in time");
}

#[tokio::test]
async fn test_out_of_order_events_are_applied_in_order() {
    let temp_dir = TempDir::new().unwrap();
    let config = SequencerConfig {
        data_dir: temp_dir.path().to_path_buf(),
        max_retries: 2,
        ..Default::default()
    };
    let storage = Arc::new(Storage::open(&config).unwrap());
    let log = MemoryLog::new("incoming");
    let projection = Arc::new(RocketProjection::new());
    let engine = Arc::new(
        OrderingEngine::new(
            storage.clone(),
            storage.clone(),
            Arc::new(log.clone()),
            projection.clone(),
            config.max_retries,
        )
        .unwrap(),
    );

    let shared: Arc<dyn AppendLog> = Arc::new(log.clone());
    let gateway = Gateway::new(shared);
    let now = Utc::now();
    gateway
        .publish_parts("r1", 3, "RocketSpeedIncreased", now, json!({"by": 200}))
        .await
        .unwrap();
    gateway
        .publish_parts(
            "r1",
            1,
            "RocketLaunched",
            now,
            json!({"type": "Falcon-9", "launchSpeed": 500, "mission": "ARTEMIS"}),
        )
        .await
        .unwrap();
    gateway
        .publish_parts("r2", 1, "RocketRefueled", now, json!({}))
        .await
        .unwrap();
    gateway
        .publish_parts("r1", 2, "RocketSpeedIncreased", now, json!({"by": 100}))
        .await
        .unwrap();
    // Duplicate of an already applied number
    gateway
        .publish_parts("r1", 1, "RocketExploded", now, json!({"reason": "late"}))
        .await
        .unwrap();

    let worker = Worker::spawn(engine, log.consumer("node-1"), worker_config());

    wait_until(|| {
        projection
            .get("r1")
            .map(|rocket| rocket.last_applied == 3)
            .unwrap_or(false)
    })
    .await;

    let dead_letters = loop {
        let listed = storage.list(10).await.unwrap();
        if !listed.is_empty() {
            break listed;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let stats = worker.shutdown().await.unwrap();

    let rocket = projection.get("r1").unwrap();
    assert_eq!(rocket.speed, 800);
    assert_eq!(rocket.status, RocketStatus::Launched);
    assert!(projection.get("r2").is_none());

    assert_eq!(dead_letters.len(), 1);
    // Unknown event types are never retried
    assert_eq!(dead_letters[0].retry_count, 0);
    assert!(dead_letters[0].reason.starts_with("non_retryable"));
    assert!(matches!(
        &dead_letters[0].original,
        DeadLetterPayload::Message(m) if m.key.as_str() == "r2"
    ));

    assert_eq!(stats.emitted, 3);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.retried, 0);
    assert_eq!(stats.dead_lettered, 1);
}
