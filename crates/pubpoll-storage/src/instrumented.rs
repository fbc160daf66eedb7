//! Tracing decorator for storages
//!
//! Wraps any [`Storage`] and runs every call inside a `storage` span carrying the storage
//! ID and the operation name. Results and errors pass through untouched.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pubpoll_types::{Error, JwtExp, JwtJti, Message, Result, StorageId, SubscriberLocator};
use tracing::{debug, info_span, Instrument, Span};

use crate::traits::{JwtStorage, ProbeDetail, PubSubStorage, Storage};

/// A storage whose operations are traced
pub struct InstrumentedStorage {
    id: StorageId,
    inner: Arc<dyn Storage>,
}

impl InstrumentedStorage {
    pub fn new(id: StorageId, inner: Arc<dyn Storage>) -> Self {
        Self { id, inner }
    }

    pub fn id(&self) -> &StorageId {
        &self.id
    }

    fn span(&self, operation: &'static str) -> Span {
        info_span!("storage", storage.id = %self.id, operation)
    }
}

async fn observe<T, F>(span: Span, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    async move {
        let started = Instant::now();
        let result = operation.await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(elapsed_ms, "Storage operation completed"),
            Err(e) => debug!(elapsed_ms, error = %e, "Storage operation failed"),
        }
        result
    }
    .instrument(span)
    .await
}

impl fmt::Display for InstrumentedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

#[async_trait]
impl Storage for InstrumentedStorage {
    fn file_descriptor_pressure(&self) -> usize {
        self.inner.file_descriptor_pressure()
    }

    async fn liveness(&self) -> Result<ProbeDetail> {
        observe(self.span("liveness"), self.inner.liveness()).await
    }

    async fn readiness(&self) -> Result<ProbeDetail> {
        observe(self.span("readiness"), self.inner.readiness()).await
    }

    async fn shutdown(&self) -> Result<()> {
        observe(self.span("shutdown"), self.inner.shutdown()).await
    }

    fn as_pubsub(&self) -> Option<&dyn PubSubStorage> {
        self.inner.as_pubsub().map(|_| self as &dyn PubSubStorage)
    }

    fn as_jwt(&self) -> Option<&dyn JwtStorage> {
        self.inner.as_jwt().map(|_| self as &dyn JwtStorage)
    }
}

#[async_trait]
impl PubSubStorage for InstrumentedStorage {
    async fn publish(&self, message: &Message) -> Result<()> {
        let inner = self.inner.as_pubsub().ok_or(Error::Unsupported("pubsub"))?;
        let span = info_span!(
            "storage",
            storage.id = %self.id,
            operation = "publish",
            channel_id = %message.channel_id,
            message_id = %message.message_id
        );
        observe(span, inner.publish(message)).await
    }

    async fn poll(
        &self,
        subscriber: &SubscriberLocator,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Message>> {
        let inner = self.inner.as_pubsub().ok_or(Error::Unsupported("pubsub"))?;
        let span = info_span!(
            "storage",
            storage.id = %self.id,
            operation = "poll",
            channel_id = %subscriber.channel_id,
            subscriber_id = %subscriber.subscriber_id,
            max_messages,
            max_wait_ms = max_wait.as_millis() as u64
        );
        observe(span, inner.poll(subscriber, max_messages, max_wait)).await
    }
}

#[async_trait]
impl JwtStorage for InstrumentedStorage {
    async fn revoke_jwt(&self, exp: JwtExp, jti: &JwtJti) -> Result<()> {
        let inner = self.inner.as_jwt().ok_or(Error::Unsupported("jwt"))?;
        let span = info_span!(
            "storage",
            storage.id = %self.id,
            operation = "revoke_jwt",
            jti = %jti,
            exp = %exp
        );
        observe(span, inner.revoke_jwt(exp, jti)).await
    }

    async fn is_revoked_jwt(&self, jti: &JwtJti) -> Result<bool> {
        let inner = self.inner.as_jwt().ok_or(Error::Unsupported("jwt"))?;
        let span = info_span!(
            "storage",
            storage.id = %self.id,
            operation = "is_revoked_jwt",
            jti = %jti
        );
        observe(span, inner.is_revoked_jwt(jti)).await
    }
}
