//! pubpoll Storage - Storage backends for the message broker
//!
//! This crate provides the storage capability traits and their implementations:
//! - In-memory storage with a background GC (default feature `memory`)
//! - A multiplexer combining several named storages into one
//! - A tracing decorator usable on any storage
//!
//! [`new_storage`] assembles all of them from the `storages` configuration section.

pub mod config;
pub mod factory;
pub mod instrumented;
pub mod multiplex;
pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports
pub use config::{
    default_storages_config, validate_storages_config, OnmemoryStorageConfig,
    RedisStorageConfig, StorageConfig, StoragesConfig,
};
pub use factory::{new_storage, ROOT_STORAGE_ID};
pub use instrumented::InstrumentedStorage;
pub use multiplex::StorageMultiplexer;
pub use traits::{JwtStorage, ProbeDetail, PubSubStorage, Storage};

#[cfg(feature = "memory")]
pub use memory::{GcStats, MemoryStorage};
