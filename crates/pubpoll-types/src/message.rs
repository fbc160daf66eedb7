//! Message types for pubpoll
//!
//! Defines the core Message struct and related types.

use bytes::Bytes;
use uuid::Uuid;

use crate::channel::ChannelId;
use crate::id::validated_id;

validated_id!(
    /// Identifier of a message, unique within its channel
    MessageId,
    "message"
);

impl MessageId {
    /// Create a new random MessageId for publishers that do not supply one
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// A message published to a channel
///
/// Messages are never mutated once published. The expiry of a stored message is owned by
/// the storage that holds it, because it depends on the channel configuration at the time
/// the message was enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message belongs to
    pub channel_id: ChannelId,

    /// Message identifier (caller supplied or generated)
    pub message_id: MessageId,

    /// Opaque payload
    pub content: Bytes,
}

impl Message {
    /// Create a new message
    pub fn new(channel_id: ChannelId, message_id: MessageId, content: impl Into<Bytes>) -> Self {
        Self {
            channel_id,
            message_id,
            content: content.into(),
        }
    }

    /// Get the content as a string (if valid UTF-8)
    pub fn content_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}
