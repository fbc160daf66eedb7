//! pubpoll Types - Core domain types for the message broker
//!
//! This crate contains all shared types used across pubpoll components.

pub mod channel;
pub mod clock;
pub mod duration;
pub mod error;
pub mod id;
pub mod jwt;
pub mod message;
pub mod subscriber;

// Re-export commonly used types
pub use channel::{Channel, ChannelId, ChannelProvider, JwtPolicy};
pub use clock::{ManualClock, RealSystemClock, SystemClock};
pub use duration::HumanDuration;
pub use error::{Error, Result};
pub use id::StorageId;
pub use jwt::{jwt_exp_from_unix, JwtExp, JwtJti};
pub use message::{Message, MessageId};
pub use subscriber::{SubscriberId, SubscriberLocator};
