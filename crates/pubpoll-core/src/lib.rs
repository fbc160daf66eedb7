//! pubpoll Core - Core business logic for the message broker
//!
//! This crate contains the main broker implementation including:
//! - Broker: Main orchestrator
//! - Channel resolution from configured regex atoms, with caching
//! - Server configuration loading
//! - Logging setup with a reloadable filter

pub mod broker;
pub mod channel;
pub mod config;
pub mod logging;

// Re-exports
pub use broker::Broker;
pub use channel::{CachedChannelProvider, ChannelConfig, ChannelJwtConfig, ConfigChannelProvider};
pub use config::{load_config_file, Overrides, ServerConfig};
pub use logging::{init_logging, LogFilterHandle};
