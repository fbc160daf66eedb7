//! Broker - Main message broker orchestrator
//!
//! The Broker is the central component that coordinates all operations. It resolves
//! channels before touching storage and turns a missing storage capability into
//! [`Error::Unsupported`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pubpoll_storage::{JwtStorage, ProbeDetail, PubSubStorage, Storage};
use pubpoll_types::{
    ChannelId, ChannelProvider, Error, JwtExp, JwtJti, Message, MessageId, Result,
    SubscriberLocator,
};
use tracing::{info, warn};

/// Main message broker
pub struct Broker {
    /// Storage backend
    storage: Arc<dyn Storage>,
    /// Channel definitions
    channels: Arc<dyn ChannelProvider>,
}

impl Broker {
    /// Create a new broker on top of a storage and a channel provider
    pub fn new(storage: Arc<dyn Storage>, channels: Arc<dyn ChannelProvider>) -> Self {
        info!(storage = %storage, "Initializing pubpoll broker");
        Self { storage, channels }
    }

    /// Get a reference to the storage
    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn channels(&self) -> &dyn ChannelProvider {
        self.channels.as_ref()
    }

    fn pubsub(&self) -> Result<&dyn PubSubStorage> {
        self.storage.as_pubsub().ok_or(Error::Unsupported("pubsub"))
    }

    fn jwt(&self) -> Result<&dyn JwtStorage> {
        self.storage.as_jwt().ok_or(Error::Unsupported("jwt"))
    }

    // ==================== Message Operations ====================

    /// Publish a message to a channel
    pub async fn publish(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        content: impl Into<Bytes>,
    ) -> Result<()> {
        let pubsub = self.pubsub()?;
        self.channels.get(&channel_id)?;
        pubsub
            .publish(&Message::new(channel_id, message_id, content))
            .await
    }

    /// Publish a message under a freshly generated ID
    pub async fn publish_generated(
        &self,
        channel_id: ChannelId,
        content: impl Into<Bytes>,
    ) -> Result<MessageId> {
        let message_id = MessageId::generate();
        self.publish(channel_id, message_id.clone(), content).await?;
        Ok(message_id)
    }

    /// Receive pending messages of a subscriber, waiting up to `max_wait`
    pub async fn poll(
        &self,
        subscriber: &SubscriberLocator,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Message>> {
        let pubsub = self.pubsub()?;
        self.channels.get(&subscriber.channel_id)?;
        pubsub.poll(subscriber, max_messages, max_wait).await
    }

    // ==================== JWT Operations ====================

    /// Revoke a token until its own expiry
    pub async fn revoke_jwt(&self, jti: &JwtJti, exp: JwtExp) -> Result<()> {
        self.jwt()?.revoke_jwt(exp, jti).await?;
        info!(jti = %jti, exp = %exp, "JWT revoked");
        Ok(())
    }

    pub async fn is_jwt_revoked(&self, jti: &JwtJti) -> Result<bool> {
        self.jwt()?.is_revoked_jwt(jti).await
    }

    // ==================== Lifecycle ====================

    pub async fn liveness(&self) -> Result<ProbeDetail> {
        self.storage.liveness().await
    }

    pub async fn readiness(&self) -> Result<ProbeDetail> {
        self.storage.readiness().await
    }

    /// Open files the process needs: channel provider and storage combined
    pub fn file_descriptor_pressure(&self) -> usize {
        self.channels.file_descriptor_pressure() + self.storage.file_descriptor_pressure()
    }

    /// Release storage resources
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down broker");
        self.storage.shutdown().await.map_err(|e| {
            warn!(error = %e, "Failed to shutdown storage");
            e
        })
    }
}
