//! Subscriber identification

use std::fmt;

use crate::channel::ChannelId;
use crate::id::validated_id;

validated_id!(
    /// Identifier of a subscriber, unique within its channel
    SubscriberId,
    "subscriber"
);

/// Locates one consumer within a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberLocator {
    pub channel_id: ChannelId,
    pub subscriber_id: SubscriberId,
}

impl SubscriberLocator {
    pub fn new(channel_id: ChannelId, subscriber_id: SubscriberId) -> Self {
        Self {
            channel_id,
            subscriber_id,
        }
    }
}

impl fmt::Display for SubscriberLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.subscriber_id)
    }
}
