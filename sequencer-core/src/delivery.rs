//! Ordered delivery to the downstream consumer
//!
//! The engine calls [`OrderedSink::deliver`] once per message, per key in
//! strictly increasing `message_number` order. An `Err` means the message
//! was not accepted: the pointer does not advance and the entry is retried.

use crate::{Error, Result, SequencedMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Ordered delivery callback
#[async_trait]
pub trait OrderedSink: Send + Sync {
    /// Accept the next message for its key
    async fn deliver(&self, message: &SequencedMessage) -> Result<()>;
}

/// Forwards ordered messages into a bounded channel
///
/// Backpressure from a slow receiver propagates to the engine. Once the
/// receiver is dropped every delivery fails.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<SequencedMessage>,
}

impl ChannelSink {
    /// Create sink and the receiving end
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SequencedMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Create sink and a `Stream` of ordered messages
    pub fn stream(capacity: usize) -> (Self, ReceiverStream<SequencedMessage>) {
        let (sink, receiver) = Self::new(capacity);
        (sink, ReceiverStream::new(receiver))
    }
}

#[async_trait]
impl OrderedSink for ChannelSink {
    async fn deliver(&self, message: &SequencedMessage) -> Result<()> {
        self.sender
            .send(message.clone())
            .await
            .map_err(|_| Error::Delivery("ordered stream receiver dropped".to_string()))
    }
}

/// Closure-backed sink for synchronous reducers
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: Fn(&SequencedMessage) -> Result<()> + Send + Sync,
{
    /// Wrap a closure
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> std::fmt::Debug for FnSink<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> OrderedSink for FnSink<F>
where
    F: Fn(&SequencedMessage) -> Result<()> + Send + Sync,
{
    async fn deliver(&self, message: &SequencedMessage) -> Result<()> {
        (self.f)(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_channel_sink_stream() {
        let (sink, stream) = ChannelSink::stream(4);
        for n in 1..=2 {
            let message = SequencedMessage::new("A", n, "T", Utc::now(), json!({}));
            sink.deliver(&message).await.unwrap();
        }
        drop(sink);

        let numbers: Vec<u64> = stream.map(|m| m.message_number).collect().await;
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_channel_sink_fails_after_receiver_dropped() {
        let (sink, receiver) = ChannelSink::new(1);
        drop(receiver);
        let message = SequencedMessage::new("A", 1, "T", Utc::now(), json!({}));
        assert!(matches!(
            sink.deliver(&message).await,
            Err(Error::Delivery(_))
        ));
    }

    #[tokio::test]
    async fn test_fn_sink() {
        let sink = FnSink::new(|m: &SequencedMessage| {
            if m.message_type == "Bad" {
                Err(Error::Delivery("rejected".to_string()))
            } else {
                Ok(())
            }
        });
        let good = SequencedMessage::new("A", 1, "Good", Utc::now(), json!({}));
        let bad = SequencedMessage::new("A", 2, "Bad", Utc::now(), json!({}));
        assert!(sink.deliver(&good).await.is_ok());
        assert!(sink.deliver(&bad).await.is_err());
    }
}
