//! Checkpoint configuration
//!
//! This module provides the serializable configuration of a checkpoint,
//! loadable from and storable to TOML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::registry::{RegistryKind, DEFAULT_CONCURRENCY_LEVEL};

/// Configuration of a checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Diagnostic name, recorded on log events
    pub name: String,

    /// Concurrent shared passes per resource id
    pub capacity: u32,

    /// Whether gates serve waiters in arrival order
    pub fair: bool,

    /// Whether callers may re-enter resources they hold
    pub reentrant: bool,

    /// Cap on outstanding passes across all ids; unset means unlimited
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_limit: Option<u32>,

    /// Whether the global cap serves waiters in arrival order
    pub global_fair: bool,

    /// Number of registry shards
    pub concurrency_level: usize,

    /// Registry implementation
    pub registry: RegistryKind,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            name: "checkpoint".to_string(),
            capacity: 1,
            fair: false,
            reentrant: false,
            global_limit: None,
            global_fair: false,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            registry: RegistryKind::RefCounted,
        }
    }
}

impl CheckpointConfig {
    /// Check that every setting is usable
    pub fn validate(&self) -> ConfigResult<()> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity(self.capacity));
        }
        if let Some(limit @ 0) = self.global_limit {
            return Err(ConfigError::InvalidGlobalLimit(limit));
        }
        if self.concurrency_level == 0 {
            return Err(ConfigError::InvalidConcurrencyLevel(self.concurrency_level));
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: CheckpointConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render configuration as TOML
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
