//! Logging initialisation
//!
//! The filter sits behind a reload layer so the admin API can change it at runtime.

use std::sync::Arc;

use anyhow::Context;
use parking_lot::RwLock;
use pubpoll_types::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use crate::config::LoggingConfig;

/// Reload layer wrapping the active filter
pub type FilterLayer = reload::Layer<EnvFilter, Registry>;

/// Reads and replaces the active log filter
#[derive(Clone)]
pub struct LogFilterHandle {
    handle: reload::Handle<EnvFilter, Registry>,
    current: Arc<RwLock<String>>,
}

impl LogFilterHandle {
    /// Build a reloadable filter layer and the handle controlling it
    pub fn new(filter: &str) -> Result<(FilterLayer, Self)> {
        let (layer, handle) = reload::Layer::new(parse_filter(filter)?);
        Ok((
            layer,
            Self {
                handle,
                current: Arc::new(RwLock::new(filter.to_string())),
            },
        ))
    }

    /// Directives of the active filter
    pub fn current(&self) -> String {
        self.current.read().clone()
    }

    /// Swap the active filter
    pub fn set(&self, filter: &str) -> Result<()> {
        let parsed = parse_filter(filter)?;
        let mut current = self.current.write();
        self.handle
            .reload(parsed)
            .map_err(|e| Error::Internal(format!("failed to reload log filter: {}", e)))?;
        *current = filter.to_string();
        Ok(())
    }
}

fn parse_filter(filter: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(filter)
        .map_err(|e| Error::InvalidParameter(format!("invalid log filter {:?}: {}", filter, e)))
}

/// Install the global subscriber
///
/// `RUST_LOG`, when set, takes precedence over the configured filter.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LogFilterHandle> {
    let filter = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| config.filter.clone());
    let (filter_layer, handle) =
        LogFilterHandle::new(&filter).context("failed to initialize logging")?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(config.json.then(|| fmt::layer().json()))
        .with((!config.json).then(fmt::layer))
        .try_init()
        .context("failed to install the global tracing subscriber")?;

    Ok(handle)
}
