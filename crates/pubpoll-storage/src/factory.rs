//! Builds the logical storage from the `storages` configuration section

use std::collections::BTreeMap;
use std::sync::Arc;

use pubpoll_types::{ChannelProvider, Error, Result, StorageId, SystemClock};
use tracing::{info, warn};

use crate::config::{StorageBackend, StoragesConfig};
use crate::instrumented::InstrumentedStorage;
use crate::multiplex::StorageMultiplexer;
use crate::traits::Storage;

/// Storage ID given to the decorated multiplexer
pub const ROOT_STORAGE_ID: &str = "#root";

fn new_backend(
    id: &StorageId,
    backend: StorageBackend<'_>,
    clock: &Arc<dyn SystemClock>,
    channels: &Arc<dyn ChannelProvider>,
) -> Result<Arc<dyn Storage>> {
    match backend {
        #[cfg(feature = "memory")]
        StorageBackend::Onmemory(config) => {
            warn!(storage = %id, "onmemory storage keeps everything in process memory, do not use it in production");
            Ok(Arc::new(crate::memory::MemoryStorage::new(
                config.clone(),
                Arc::clone(clock),
                Arc::clone(channels),
            )))
        }
        #[cfg(not(feature = "memory"))]
        StorageBackend::Onmemory(_) => Err(Error::Config(format!(
            "storage[{}]: onmemory storage is not available in this build",
            id
        ))),
        StorageBackend::Redis(_) => Err(Error::Config(format!(
            "storage[{}]: redis storage is not available in this build",
            id
        ))),
    }
}

/// Create every configured storage, trace each one, and combine them into one storage
///
/// An empty section falls back to a single in-memory storage.
pub fn new_storage(
    config: &StoragesConfig,
    clock: Arc<dyn SystemClock>,
    channels: Arc<dyn ChannelProvider>,
) -> Result<Arc<dyn Storage>> {
    let default_config;
    let config = if config.is_empty() {
        default_config = crate::config::default_storages_config();
        &default_config
    } else {
        config
    };

    let mut children: BTreeMap<StorageId, Arc<dyn Storage>> = BTreeMap::new();
    for (id, storage_config) in config {
        let backend = storage_config.backend(id)?;
        let storage = new_backend(id, backend, &clock, &channels)?;
        info!(storage = %id, kind = %storage, "Storage initialized");
        children.insert(
            id.clone(),
            Arc::new(InstrumentedStorage::new(id.clone(), storage)),
        );
    }

    let multiplexer = StorageMultiplexer::new(children)?;
    Ok(Arc::new(InstrumentedStorage::new(
        StorageId::new(ROOT_STORAGE_ID),
        Arc::new(multiplexer),
    )))
}
