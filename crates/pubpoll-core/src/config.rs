//! Server configuration
//!
//! Loaded from a YAML file with camelCase keys. Every section is optional; missing values
//! fall back to defaults suitable for local development.

use std::io::{Read, Write};
use std::path::Path;

use anyhow::{bail, Context};
use pubpoll_storage::{default_storages_config, validate_storages_config, StoragesConfig};
use pubpoll_types::HumanDuration;
use serde::{Deserialize, Serialize};

use crate::channel::{ChannelConfig, ConfigChannelProvider};

/// Log filter used when `--debug` is given
pub const DEBUG_LOG_FILTER: &str = "pubpoll=debug,tower_http=debug";

/// Root of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    #[serde(default)]
    pub storages: StoragesConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Mount every route under this path, e.g. `/pubpoll`
    #[serde(default)]
    pub path_prefix: String,

    /// Upper bound for the `timeout` parameter of long-polling requests
    #[serde(default = "default_long_polling_max_timeout")]
    pub long_polling_max_timeout: HumanDuration,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_long_polling_max_timeout() -> HumanDuration {
    HumanDuration::from_secs(30)
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            path_prefix: String::new(),
            long_polling_max_timeout: default_long_polling_max_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdminConfig {
    #[serde(default)]
    pub auth: AdminAuthConfig,
}

/// Credentials of the admin API. No token disables the admin API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdminAuthConfig {
    #[serde(default)]
    pub bearer_tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit one JSON object per line
    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "pubpoll=info,tower_http=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

/// Values given on the command line, applied over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub listen: Option<String>,
    pub debug: bool,
}

impl ServerConfig {
    /// Parse a configuration document, then fill defaults and apply overrides
    pub fn parse(content: &str, overrides: &Overrides) -> anyhow::Result<Self> {
        if content.contains('\t') {
            bail!("Configuration file could not contain tab character (0x09) because YAML forbids it, use space to indent");
        }

        let mut config: ServerConfig = if content.trim().is_empty() {
            ServerConfig::default()
        } else {
            serde_yaml::from_str(content).context("failed to parse configuration")?
        };
        config.apply_defaults();
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        self.http.path_prefix = self.http.path_prefix.trim_end_matches('/').to_string();
        if self.channels.is_empty() {
            self.channels.push(ChannelConfig::catch_all());
        }
        if self.storages.is_empty() {
            self.storages = default_storages_config();
        }
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(port) = overrides.port {
            self.http.port = port;
        }
        if let Some(listen) = &overrides.listen {
            self.http.listen = listen.clone();
        }
        if overrides.debug {
            self.logging.filter = DEBUG_LOG_FILTER.to_string();
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        let prefix = &self.http.path_prefix;
        if !prefix.is_empty() && !prefix.starts_with('/') {
            bail!("http.pathPrefix {:?} must start with '/'", prefix);
        }
        if prefix.contains(|c: char| matches!(c, ':' | '*' | '{' | '}')) {
            bail!("http.pathPrefix {:?} must not contain path parameters", prefix);
        }
        validate_storages_config(&self.storages)?;
        ConfigChannelProvider::new(&self.channels)?;
        Ok(())
    }

    /// Write the effective configuration as YAML
    pub fn dump_config(&self, writer: impl Write) -> anyhow::Result<()> {
        serde_yaml::to_writer(writer, self).context("failed to dump configuration")
    }
}

/// Load the configuration file at `path`
///
/// `-` reads standard input. Without a path the defaults are used.
pub fn load_config_file(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<ServerConfig> {
    let content = match path {
        None => String::new(),
        Some(path) if path == Path::new("-") => {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .context("failed to read configuration from stdin")?;
            content
        }
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?,
    };
    ServerConfig::parse(&content, overrides)
        .with_context(|| match path {
            Some(path) => format!("invalid configuration in {}", path.display()),
            None => "invalid default configuration".to_string(),
        })
}
