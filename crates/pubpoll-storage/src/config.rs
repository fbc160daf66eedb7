//! Storage configuration
//!
//! The `storages` section maps a storage ID to exactly one backend block.

use std::collections::BTreeMap;

use pubpoll_types::{Error, HumanDuration, Result, StorageId};
use serde::{Deserialize, Serialize};

/// Settings of the in-memory backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OnmemoryStorageConfig {
    /// Hide the publish/subscribe capability
    #[serde(default)]
    pub disable_pub_sub: bool,

    /// Hide the JWT revocation capability
    #[serde(default)]
    pub disable_jwt: bool,

    /// Pause between GC passes
    #[serde(default = "default_gc_interval")]
    pub gc_interval: HumanDuration,

    /// Deadline of a single GC pass
    #[serde(default = "default_gc_timeout")]
    pub gc_timeout: HumanDuration,
}

fn default_gc_interval() -> HumanDuration {
    HumanDuration::from_secs(5 * 60)
}

fn default_gc_timeout() -> HumanDuration {
    HumanDuration::from_secs(3)
}

impl Default for OnmemoryStorageConfig {
    fn default() -> Self {
        Self {
            disable_pub_sub: false,
            disable_jwt: false,
            gc_interval: default_gc_interval(),
            gc_timeout: default_gc_timeout(),
        }
    }
}

/// Settings of a networked key-value backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RedisStorageConfig {
    /// `host:port` of a single node deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_node: Option<String>,

    /// `host:port` of every cluster node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Vec<String>>,
}

/// One entry of the `storages` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onmemory: Option<OnmemoryStorageConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisStorageConfig>,
}

/// The backend selected by a [`StorageConfig`]
#[derive(Debug, Clone, Copy)]
pub enum StorageBackend<'a> {
    Onmemory(&'a OnmemoryStorageConfig),
    Redis(&'a RedisStorageConfig),
}

impl StorageConfig {
    pub fn onmemory(config: OnmemoryStorageConfig) -> Self {
        Self {
            onmemory: Some(config),
            redis: None,
        }
    }

    /// Resolve the single backend block, rejecting empty or ambiguous entries
    pub fn backend(&self, id: &StorageId) -> Result<StorageBackend<'_>> {
        match (&self.onmemory, &self.redis) {
            (Some(onmemory), None) => {
                if onmemory.gc_interval.as_duration().is_zero() {
                    return Err(item_error(id, "onmemory.gcInterval must be greater than zero"));
                }
                if onmemory.gc_timeout.as_duration().is_zero() {
                    return Err(item_error(id, "onmemory.gcTimeout must be greater than zero"));
                }
                Ok(StorageBackend::Onmemory(onmemory))
            }
            (None, Some(redis)) => Ok(StorageBackend::Redis(redis)),
            (None, None) => Err(item_error(id, "no storage type under the item")),
            (Some(_), Some(_)) => Err(item_error(
                id,
                "found multiple storage type under single item. To configure multiple storages, write separate storage definitions",
            )),
        }
    }
}

fn item_error(id: &StorageId, detail: &str) -> Error {
    Error::Config(format!(
        "there is a configuration error on storage[{}]: {}",
        id, detail
    ))
}

/// The `storages` section
pub type StoragesConfig = BTreeMap<StorageId, StorageConfig>;

/// Storages used when none is configured: one in-memory backend
pub fn default_storages_config() -> StoragesConfig {
    let mut storages = StoragesConfig::new();
    storages.insert(
        StorageId::new("default"),
        StorageConfig::onmemory(OnmemoryStorageConfig::default()),
    );
    storages
}

/// Check every entry of the `storages` section
pub fn validate_storages_config(storages: &StoragesConfig) -> Result<()> {
    for (id, config) in storages {
        config.backend(id)?;
    }
    Ok(())
}
