//! Storage capability traits
//!
//! Every backend implements [`Storage`]. Publish/subscribe and JWT revocation are optional
//! capabilities: a backend exposes them through [`Storage::as_pubsub`] and
//! [`Storage::as_jwt`], and `None` means "not supported" rather than failure.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use pubpoll_types::{JwtExp, JwtJti, Message, Result, SubscriberLocator};

/// Free-form detail returned by health probes
pub type ProbeDetail = serde_json::Value;

/// Base storage contract - all backends implement this
///
/// `Display` gives a short diagnostic identity of the instance.
#[async_trait]
pub trait Storage: fmt::Display + Send + Sync {
    /// How many file descriptors / connections this instance may hold open
    fn file_descriptor_pressure(&self) -> usize;

    /// Reports whether the instance is fundamentally broken
    async fn liveness(&self) -> Result<ProbeDetail>;

    /// Reports whether the instance can serve traffic right now
    async fn readiness(&self) -> Result<ProbeDetail>;

    /// Release resources. Call exactly once.
    async fn shutdown(&self) -> Result<()>;

    /// Publish/subscribe capability, if supported
    fn as_pubsub(&self) -> Option<&dyn PubSubStorage>;

    /// JWT revocation capability, if supported
    fn as_jwt(&self) -> Option<&dyn JwtStorage>;
}

/// Channel message delivery
#[async_trait]
pub trait PubSubStorage: Send + Sync {
    /// Store a message and enqueue it for every subscriber of its channel
    ///
    /// Publishing a message ID already known to the channel is a no-op.
    async fn publish(&self, message: &Message) -> Result<()>;

    /// Take up to `max_messages` pending messages of a subscriber
    ///
    /// Waits up to `max_wait` for a publish when nothing is pending. A timeout yields an
    /// empty vector, not an error. Dropping the returned future never loses messages.
    async fn poll(
        &self,
        subscriber: &SubscriberLocator,
        max_messages: usize,
        max_wait: Duration,
    ) -> Result<Vec<Message>>;
}

/// JWT revocation tracking
#[async_trait]
pub trait JwtStorage: Send + Sync {
    /// Mark a token as revoked until its own expiry. Idempotent.
    async fn revoke_jwt(&self, exp: JwtExp, jti: &JwtJti) -> Result<()>;

    /// Whether a token has been revoked
    async fn is_revoked_jwt(&self, jti: &JwtJti) -> Result<bool>;
}
