// Checkpoint errors
//
// This module defines the error types surfaced by the checkpoint protocol
// and by the configuration layer. Running out of capacity is not an error:
// try-variants report it as "no pass" and blocking variants keep waiting.

use std::fmt::Debug;
use thiserror::Error;

/// Error type for pass acquisition
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// The waiting thread was interrupted before a pass was granted.
    /// Permits taken by earlier stages of the same request have been returned.
    #[error("Pass acquisition interrupted")]
    Interrupted,

    /// A reentrant caller holding a shared pass asked for exclusive access
    /// to the same resource
    #[error("Upgrading a shared pass to an exclusive pass is not supported (resource {resource})")]
    UnsupportedEscalation {
        /// Debug rendering of the resource id
        resource: String,
    },
}

impl CheckpointError {
    /// Create an escalation error for the given resource id
    pub fn escalation(resource: &impl Debug) -> Self {
        Self::UnsupportedEscalation {
            resource: format!("{:?}", resource),
        }
    }

    /// Whether this error reports an interrupted wait
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Convenient type alias for checkpoint results
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Error type for checkpoint configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Per-resource capacity must allow at least one pass
    #[error("Invalid capacity: {0} (must be at least 1)")]
    InvalidCapacity(u32),

    /// The global limit must be positive; use `None` for unlimited
    #[error("Invalid global limit: {0} (must be positive, or unset for unlimited)")]
    InvalidGlobalLimit(u32),

    /// The registry needs at least one shard
    #[error("Invalid concurrency level: {0} (must be at least 1)")]
    InvalidConcurrencyLevel(usize),

    /// The TOML document could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered as TOML
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The configuration file could not be read or written
    #[error("Configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_message_names_resource() {
        let err = CheckpointError::escalation(&"printer");
        assert_eq!(
            err.to_string(),
            "Upgrading a shared pass to an exclusive pass is not supported (resource \"printer\")"
        );
        assert!(!err.is_interrupted());
        assert!(CheckpointError::Interrupted.is_interrupted());
    }

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::InvalidCapacity(0).to_string(),
            "Invalid capacity: 0 (must be at least 1)"
        );
        assert_eq!(
            ConfigError::InvalidConcurrencyLevel(0).to_string(),
            "Invalid concurrency level: 0 (must be at least 1)"
        );
    }
}
