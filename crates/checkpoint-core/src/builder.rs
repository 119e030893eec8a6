// Checkpoint construction
//
// `CheckpointBuilder` turns a `CheckpointConfig` into a ready checkpoint.
// Whether the result is reentrant is a runtime setting, so the builder
// produces an `AnyCheckpoint` covering both variants.

use std::fmt;
use std::sync::Arc;

use crate::checkpoint::{Checkpoint, SimpleCheckpoint};
use crate::config::CheckpointConfig;
use crate::error::{ConfigResult, Result};
use crate::gate::{AccessMode, GateFactory, ResourceKey};
use crate::pass::Pass;
use crate::reentrant::{CallerContext, ReentrantCheckpoint, ThreadCaller};
use crate::registry::{RegistryKind, ResourceRegistry};
use crate::semaphore::WaitPolicy;

/// Fluent construction of checkpoints
#[derive(Debug, Clone, Default)]
pub struct CheckpointBuilder {
    config: CheckpointConfig,
}

impl CheckpointBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a loaded configuration
    pub fn from_config(config: CheckpointConfig) -> Self {
        Self { config }
    }

    /// Set the diagnostic name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the number of concurrent shared passes per id
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Serve gate waiters in arrival order
    pub fn fair(mut self, fair: bool) -> Self {
        self.config.fair = fair;
        self
    }

    /// Allow callers to re-enter resources they hold
    pub fn reentrant(mut self, reentrant: bool) -> Self {
        self.config.reentrant = reentrant;
        self
    }

    /// Cap outstanding passes across all ids
    pub fn global_limit(mut self, limit: u32) -> Self {
        self.config.global_limit = Some(limit);
        self
    }

    /// Remove the global cap
    pub fn unlimited(mut self) -> Self {
        self.config.global_limit = None;
        self
    }

    /// Serve global cap waiters in arrival order
    pub fn global_fair(mut self, fair: bool) -> Self {
        self.config.global_fair = fair;
        self
    }

    /// Set the number of registry shards
    pub fn concurrency_level(mut self, level: usize) -> Self {
        self.config.concurrency_level = level;
        self
    }

    /// Choose the registry implementation
    pub fn registry(mut self, kind: RegistryKind) -> Self {
        self.config.registry = kind;
        self
    }

    /// The configuration built so far
    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Build a checkpoint whose reentrancy is tracked per thread
    pub fn build<K: ResourceKey>(&self) -> ConfigResult<AnyCheckpoint<K>> {
        self.build_with_caller(ThreadCaller)
    }

    /// Build a checkpoint whose reentrancy is tracked per `caller` id
    ///
    /// `caller` is unused when the configuration is not reentrant.
    pub fn build_with_caller<K: ResourceKey, C: CallerContext>(
        &self,
        caller: C,
    ) -> ConfigResult<AnyCheckpoint<K, C>> {
        let config = &self.config;
        config.validate()?;

        let name: Arc<str> = Arc::from(config.name.as_str());
        let factory = GateFactory::new(config.capacity, config.fair);
        let registry = config
            .registry
            .create(name.clone(), factory, config.concurrency_level);
        let simple = SimpleCheckpoint::new(name, registry, config.global_limit, config.global_fair);

        Ok(if config.reentrant {
            AnyCheckpoint::Reentrant(ReentrantCheckpoint::with_caller(simple, caller))
        } else {
            AnyCheckpoint::Simple(simple)
        })
    }
}

/// A checkpoint of either flavour
pub enum AnyCheckpoint<K: ResourceKey, C: CallerContext = ThreadCaller> {
    /// Every call is a separate admission
    Simple(SimpleCheckpoint<K>),
    /// Nested calls by the same caller share one admission
    Reentrant(ReentrantCheckpoint<K, C>),
}

impl<K: ResourceKey, C: CallerContext> AnyCheckpoint<K, C> {
    /// Whether nested acquisitions by one caller share a grant
    pub fn is_reentrant(&self) -> bool {
        matches!(self, Self::Reentrant(_))
    }

    /// The registry holding the gates
    pub fn registry(&self) -> &Arc<dyn ResourceRegistry<K>> {
        match self {
            Self::Simple(checkpoint) => checkpoint.registry(),
            Self::Reentrant(checkpoint) => checkpoint.inner().registry(),
        }
    }
}

impl<K: ResourceKey, C: CallerContext> Checkpoint<K> for AnyCheckpoint<K, C> {
    fn acquire(&self, id: &K, mode: AccessMode, wait: WaitPolicy) -> Result<Option<Pass<K>>> {
        match self {
            Self::Simple(checkpoint) => checkpoint.acquire(id, mode, wait),
            Self::Reentrant(checkpoint) => checkpoint.acquire(id, mode, wait),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Simple(checkpoint) => checkpoint.name(),
            Self::Reentrant(checkpoint) => checkpoint.name(),
        }
    }

    fn global_limit(&self) -> Option<u32> {
        match self {
            Self::Simple(checkpoint) => checkpoint.global_limit(),
            Self::Reentrant(checkpoint) => checkpoint.global_limit(),
        }
    }

    fn available_global_permits(&self) -> Option<u32> {
        match self {
            Self::Simple(checkpoint) => checkpoint.available_global_permits(),
            Self::Reentrant(checkpoint) => checkpoint.available_global_permits(),
        }
    }
}

impl<K: ResourceKey, C: CallerContext> Clone for AnyCheckpoint<K, C> {
    fn clone(&self) -> Self {
        match self {
            Self::Simple(checkpoint) => Self::Simple(checkpoint.clone()),
            Self::Reentrant(checkpoint) => Self::Reentrant(checkpoint.clone()),
        }
    }
}

impl<K: ResourceKey, C: CallerContext> fmt::Debug for AnyCheckpoint<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(checkpoint) => fmt::Debug::fmt(checkpoint, f),
            Self::Reentrant(checkpoint) => fmt::Debug::fmt(checkpoint, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    #[test]
    fn test_builder_applies_settings() {
        let checkpoint = CheckpointBuilder::new()
            .name("devices")
            .capacity(30)
            .fair(true)
            .global_limit(600)
            .concurrency_level(4)
            .build::<u32>()
            .unwrap();

        assert!(!checkpoint.is_reentrant());
        assert_eq!(checkpoint.name(), "devices");
        assert_eq!(checkpoint.global_limit(), Some(600));
        assert_eq!(checkpoint.registry().shard_count(), 4);
        assert_eq!(checkpoint.registry().factory(), GateFactory::new(30, true));

        let pass = checkpoint.shared(&1).unwrap();
        assert_eq!(pass.checkpoint_name(), "devices");
        let gate = checkpoint.registry().peek(&1).unwrap();
        assert_eq!(gate.available_permits(), 29);
    }

    #[test]
    fn test_builder_from_config_builds_reentrant_pinned() {
        let config = CheckpointConfig {
            reentrant: true,
            registry: RegistryKind::Pinned,
            ..CheckpointConfig::default()
        };
        let checkpoint = CheckpointBuilder::from_config(config)
            .unlimited()
            .build::<&'static str>()
            .unwrap();

        assert!(checkpoint.is_reentrant());
        assert_eq!(checkpoint.registry().kind(), RegistryKind::Pinned);
        assert_eq!(checkpoint.available_global_permits(), None);

        let outer = checkpoint.exclusive(&"a").unwrap();
        let inner = checkpoint.exclusive(&"a").unwrap();
        assert!(outer.same_grant(&inner));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let err = CheckpointBuilder::new().capacity(0).build::<u8>().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCapacity(0)));

        let err = CheckpointBuilder::new().global_limit(0).build::<u8>().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidGlobalLimit(0)));
    }
}
