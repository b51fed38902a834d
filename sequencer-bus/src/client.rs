//! NATS connection

use crate::{Error, Result};
use async_nats::jetstream::Context as JetStreamContext;
use tracing::info;

/// Connected NATS client with its JetStream context
#[derive(Debug, Clone)]
pub struct NatsClient {
    client: async_nats::Client,
    jetstream: JetStreamContext,
}

impl NatsClient {
    /// Connect to a NATS server
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to NATS JetStream at {}", url);

        let client = async_nats::connect(url)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        let jetstream = async_nats::jetstream::new(client.clone());

        Ok(Self { client, jetstream })
    }

    /// Core NATS client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    /// JetStream context
    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    /// Flush buffered publishes
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| Error::Connection(format!("Flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_client_connect() {
        let client = NatsClient::connect("nats://localhost:4222").await;
        assert!(client.is_ok());
    }
}
