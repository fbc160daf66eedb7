//! Channel types for pubpoll
//!
//! A channel is resolved from its ID by a [`ChannelProvider`]. Storages only ask a
//! channel for its expiry; the JWT policy is consumed by the authorization layer.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::id::validated_id;

validated_id!(
    /// Identifier of a channel
    ChannelId,
    "channel"
);

/// JWT acceptance policy attached to a channel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JwtPolicy {
    /// Accepted `iss` claim values
    pub issuers: Vec<String>,

    /// Tolerated clock difference when checking `exp` / `nbf`
    pub clock_skew_leeway: Duration,
}

/// A resolved channel definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    id: ChannelId,
    expire: Duration,
    jwt: Option<JwtPolicy>,
}

impl Channel {
    /// Create a channel without JWT policy
    pub fn new(id: ChannelId, expire: Duration) -> Self {
        Self {
            id,
            expire,
            jwt: None,
        }
    }

    /// Attach a JWT policy
    pub fn with_jwt(mut self, jwt: JwtPolicy) -> Self {
        self.jwt = Some(jwt);
        self
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// How long messages and idle subscribers of this channel are kept
    pub fn expire(&self) -> Duration {
        self.expire
    }

    pub fn jwt(&self) -> Option<&JwtPolicy> {
        self.jwt.as_ref()
    }
}

/// Resolves channel IDs to channel definitions
pub trait ChannelProvider: Send + Sync {
    /// Resolve a channel, failing with [`crate::Error::InvalidChannel`] if the ID matches
    /// no channel definition
    fn get(&self, id: &ChannelId) -> Result<Arc<Channel>>;

    /// Number of file descriptors this provider may hold open
    fn file_descriptor_pressure(&self) -> usize {
        0
    }

    /// Largest JWT clock skew leeway across all channel definitions
    fn jwt_clock_skew_leeway_max(&self) -> Duration;
}
