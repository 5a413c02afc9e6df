//! Outbound side of the MQTT session.

use std::future::Future;

use rumqttc::{AsyncClient, QoS};
use thiserror::Error;

/// Errors returned when a request cannot be queued on the session.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Requests the keepalive controller sends to the broker.
///
/// Both operations use QoS 0; publishes are never retained.
pub trait CommandChannel: Send + Sync {
    fn subscribe(&self, topic: &str) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;
}

/// [`CommandChannel`] backed by a rumqttc client handle.
#[derive(Clone)]
pub struct MqttChannel {
    client: AsyncClient,
}

impl MqttChannel {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }

    /// Queue a DISCONNECT packet.
    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        self.client.disconnect().await
    }
}

impl CommandChannel for MqttChannel {
    async fn subscribe(&self, topic: &str) -> Result<(), ChannelError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| ChannelError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| ChannelError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}
