//! NATS JetStream backend for the sequencer
//!
//! Provides:
//! - An append log publishing to one subject per partition, with retry
//! - Durable pull consumers per partition for competing workers
//! - A dead-letter stream router
//! - Observability via Prometheus metrics

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod dlq_router;
pub mod error;
pub mod jetstream;
pub mod metrics;
pub mod partitioning;
pub mod publisher;
pub mod subscriber;

pub use client::NatsClient;
pub use dlq_router::{DlqRouter, DlqStats};
pub use error::{Error, Result};
pub use jetstream::JetStreamManager;
pub use metrics::BusMetrics;
pub use partitioning::{HashPartitioning, PartitioningStrategy};
pub use publisher::{JetStreamLog, PublisherConfig};
pub use subscriber::JetStreamReader;
