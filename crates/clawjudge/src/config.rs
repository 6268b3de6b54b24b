//! Service configuration.
//!
//! One TOML file with a section per component:
//! - `[storage]` tuning of the storage buffer
//! - `[query]` downstream data and index endpoints
//! - `[publisher]` where events go
//! - `[strategy]` the strategy catalog
//! - `[identity]` the name this node reports to the catalog

use std::path::Path;

use claw_judge::{PublisherConfig, StrategyCatalogConfig};
use claw_series::{HttpQueryConfig, StorageBufferConfig};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Node identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Explicit identity; the host name is used when empty.
    pub specify: String,
}

/// Main configuration of clawjudge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    /// Storage buffer tuning.
    pub storage: StorageBufferConfig,
    /// Downstream query service.
    pub query: HttpQueryConfig,
    /// Event publisher.
    pub publisher: PublisherConfig,
    /// Strategy catalog.
    pub strategy: StrategyCatalogConfig,
    /// Node identity.
    pub identity: IdentityConfig,
}

impl JudgeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ConfigError::Invalid(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Invalid(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("storage.batch", self.storage.batch),
            ("storage.concurrency", self.storage.concurrency),
            ("storage.queue_size", self.storage.queue_size),
            ("storage.shardset_size", self.storage.shardset_size),
            ("storage.history_size", self.storage.history_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }

        self.publisher
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let has_file = self.strategy.file.as_deref().is_some_and(|f| !f.is_empty());
        if self.strategy.addrs.is_empty() && !has_file {
            return Err(ConfigError::Invalid(
                "either strategy.addrs or strategy.file must be set".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the identity reported to the strategy catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if no identity is configured and the host name is unavailable.
    pub fn identity(&self) -> Result<String, ConfigError> {
        if !self.identity.specify.is_empty() {
            return Ok(self.identity.specify.clone());
        }
        let name = hostname::get().map_err(|e| ConfigError::Identity(e.to_string()))?;
        let name = name.to_string_lossy().to_string();
        if name.is_empty() {
            return Err(ConfigError::Identity("host name is empty".to_string()));
        }
        Ok(name)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(format!("failed to serialize config: {e}")))
    }

    /// Write the configuration to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// A starting point for `init-config`: defaults plus local placeholder endpoints.
    #[must_use]
    pub fn sample() -> Self {
        let mut config = Self::default();
        config.query.addrs = vec!["http://127.0.0.1:7900/api/query".to_string()];
        config.query.index_addrs = vec!["http://127.0.0.1:7901/api/xclude".to_string()];
        config.strategy.addrs = vec!["127.0.0.1:5800".to_string()];
        config
    }
}
