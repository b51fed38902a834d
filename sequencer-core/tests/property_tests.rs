//! Property-based tests for ordering invariants
//!
//! These tests use proptest to verify:
//! - Drain completeness: any permutation of 1..N is delivered as 1..N
//! - No re-delivery: duplicates never produce a second delivery
//! - Gap persistence: nothing after a missing number is delivered
//! - Per-key isolation: one key's gaps never hold back another key

use parking_lot::Mutex;
use proptest::prelude::*;
use sequencer_core::{
    Gateway, GroupReader, MemoryLog, MemoryStore, OrderingEngine, PartitionKey,
    SequenceCounterStore, SequencedMessage, SequencerConfig, Stash, Storage, FnSink,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

type Delivered = Arc<Mutex<Vec<(String, u64)>>>;

fn recording_sink(delivered: Delivered) -> FnSink<impl Fn(&SequencedMessage) -> sequencer_core::Result<()>> {
    FnSink::new(move |message: &SequencedMessage| {
        delivered
            .lock()
            .push((message.key.to_string(), message.message_number));
        Ok(())
    })
}

struct Pipeline {
    log: MemoryLog,
    gateway: Gateway,
    engine: OrderingEngine,
    delivered: Delivered,
}

impl Pipeline {
    fn new(store: Arc<MemoryStore>) -> Self {
        let log = MemoryLog::new("incoming");
        let delivered: Delivered = Arc::default();
        let engine = OrderingEngine::new(
            store.clone(),
            store,
            Arc::new(log.clone()),
            Arc::new(recording_sink(delivered.clone())),
            5,
        )
        .unwrap();

        Self {
            gateway: Gateway::new(Arc::new(log.clone())),
            log,
            engine,
            delivered,
        }
    }

    async fn publish(&self, key: &str, n: u64) {
        self.gateway
            .publish_parts(key, n, "T", chrono::Utc::now(), serde_json::json!({ "n": n }))
            .await
            .unwrap();
    }

    async fn run(&self) {
        let mut reader = self.log.consumer("w1");
        loop {
            let batch = reader.read(16, Duration::from_millis(2)).await.unwrap();
            if batch.is_empty() {
                return;
            }
            for entry in batch {
                self.engine.process(entry).await;
            }
        }
    }

    fn delivered_for(&self, key: &str) -> Vec<u64> {
        self.delivered
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, n)| *n)
            .collect()
    }
}

/// A permutation of 1..=n for n in 1..max
fn permutation(max: u64) -> impl Strategy<Value = Vec<u64>> {
    (1..max).prop_flat_map(|n| Just((1..=n).collect::<Vec<u64>>()).prop_shuffle())
}

/// Longest prefix 1..=k fully present in `seen`
fn contiguous_prefix(seen: &BTreeSet<u64>) -> u64 {
    let mut k = 0;
    while seen.contains(&(k + 1)) {
        k += 1;
    }
    k
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every permutation of 1..N drains to 1..N with an empty stash
    #[test]
    fn prop_drain_completeness(order in permutation(40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let pipeline = Pipeline::new(store.clone());
            for n in &order {
                pipeline.publish("A", *n).await;
            }
            pipeline.run().await;

            let expected: Vec<u64> = (1..=order.len() as u64).collect();
            prop_assert_eq!(pipeline.delivered_for("A"), expected);

            let key = PartitionKey::new("A");
            prop_assert_eq!(store.current(&key).await.unwrap(), Some(order.len() as u64 + 1));
            prop_assert_eq!(store.count(&key).await.unwrap(), 0);
            Ok(())
        })?;
    }

    /// Property: arbitrary arrivals with duplicates deliver each number once, in order
    #[test]
    fn prop_duplicates_never_redelivered(
        arrivals in prop::collection::vec((prop_oneof![Just("A"), Just("B")], 1u64..12), 1..60)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pipeline = Pipeline::new(Arc::new(MemoryStore::new()));
            let mut seen: HashMap<&str, BTreeSet<u64>> = HashMap::new();
            for (key, n) in &arrivals {
                pipeline.publish(key, *n).await;
                seen.entry(*key).or_default().insert(*n);
            }
            pipeline.run().await;

            for key in ["A", "B"] {
                let prefix = seen.get(key).map(contiguous_prefix).unwrap_or(0);
                let expected: Vec<u64> = (1..=prefix).collect();
                prop_assert_eq!(pipeline.delivered_for(key), expected);
            }
            Ok(())
        })?;
    }

    /// Property: without message 1 nothing is ever delivered
    #[test]
    fn prop_gap_persistence(later in prop::collection::btree_set(2u64..50, 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(MemoryStore::new());
            let pipeline = Pipeline::new(store.clone());
            for n in &later {
                pipeline.publish("A", *n).await;
            }
            pipeline.run().await;

            prop_assert!(pipeline.delivered_for("A").is_empty());
            let key = PartitionKey::new("A");
            prop_assert_eq!(store.current(&key).await.unwrap(), Some(1));
            prop_assert_eq!(store.count(&key).await.unwrap(), later.len() as u64);
            Ok(())
        })?;
    }

    /// Property: a stalled key never holds back another key
    #[test]
    fn prop_keys_are_isolated(order in permutation(20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let pipeline = Pipeline::new(Arc::new(MemoryStore::new()));
            pipeline.publish("stalled", 2).await;
            for n in &order {
                pipeline.publish("B", *n).await;
            }
            pipeline.run().await;

            prop_assert!(pipeline.delivered_for("stalled").is_empty());
            prop_assert_eq!(pipeline.delivered_for("B").len(), order.len());
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_rocksdb_state_survives_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = SequencerConfig {
        data_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };
    let key = PartitionKey::new("A");

    {
        let storage = Arc::new(Storage::open(&config).unwrap());
        let log = MemoryLog::new("incoming");
        let delivered: Delivered = Arc::default();
        let engine = OrderingEngine::new(
            storage.clone(),
            storage.clone(),
            Arc::new(log.clone()),
            Arc::new(recording_sink(delivered.clone())),
            5,
        )
        .unwrap();
        let gateway = Gateway::new(Arc::new(log.clone()));
        for n in [1, 3, 4] {
            gateway
                .publish_parts("A", n, "T", chrono::Utc::now(), serde_json::json!({}))
                .await
                .unwrap();
        }

        let mut reader = log.consumer("w1");
        for entry in reader.read(10, Duration::from_millis(5)).await.unwrap() {
            engine.process(entry).await;
        }
        assert_eq!(delivered.lock().len(), 1);
        storage.flush().unwrap();
    }

    let storage = Arc::new(Storage::open(&config).unwrap());
    assert_eq!(storage.current(&key).await.unwrap(), Some(2));
    assert_eq!(storage.count(&key).await.unwrap(), 2);

    let log = MemoryLog::new("incoming");
    let delivered: Delivered = Arc::default();
    let engine = OrderingEngine::new(
        storage.clone(),
        storage.clone(),
        Arc::new(log.clone()),
        Arc::new(recording_sink(delivered.clone())),
        5,
    )
    .unwrap();
    Gateway::new(Arc::new(log.clone()))
        .publish_parts("A", 2, "T", chrono::Utc::now(), serde_json::json!({}))
        .await
        .unwrap();

    let mut reader = log.consumer("w1");
    for entry in reader.read(10, Duration::from_millis(5)).await.unwrap() {
        engine.process(entry).await;
    }

    let numbers: Vec<u64> = delivered.lock().iter().map(|(_, n)| *n).collect();
    assert_eq!(numbers, vec![2, 3, 4]);
    assert_eq!(storage.current(&key).await.unwrap(), Some(5));
    assert_eq!(storage.count(&key).await.unwrap(), 0);
}
