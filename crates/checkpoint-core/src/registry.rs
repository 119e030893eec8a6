// Resource registries
//
// A registry maps resource ids to their gates, creating gates on first use.
// `RefCountedRegistry` evicts a gate once the last reference to it is
// released, so the map only holds ids that are in use. `PinnedRegistry`
// keeps every gate forever and suits a small, known set of ids.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::gate::{GateFactory, ResourceGate, ResourceKey};
use crate::shard::ShardedMap;

pub use crate::shard::DEFAULT_CONCURRENCY_LEVEL;

/// Which registry implementation a checkpoint uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryKind {
    /// Reference-counted registry that evicts unused gates
    #[default]
    RefCounted,
    /// Registry that never evicts
    Pinned,
}

impl RegistryKind {
    /// Build a registry of this kind
    pub fn create<K: ResourceKey>(
        self,
        name: impl Into<Arc<str>>,
        factory: GateFactory,
        concurrency_level: usize,
    ) -> Arc<dyn ResourceRegistry<K>> {
        match self {
            Self::RefCounted => Arc::new(
                RefCountedRegistry::new(factory, concurrency_level).named(name),
            ),
            Self::Pinned => Arc::new(PinnedRegistry::new(factory, concurrency_level).named(name)),
        }
    }
}

impl fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefCounted => write!(f, "ref_counted"),
            Self::Pinned => write!(f, "pinned"),
        }
    }
}

/// Lookup and lifecycle of resource gates
pub trait ResourceRegistry<K: ResourceKey>: Send + Sync {
    /// Return the gate for `id`, creating it if needed, and take a reference to it
    fn get(&self, id: &K) -> Arc<ResourceGate<K>>;

    /// Give back a reference taken by [`ResourceRegistry::get`]
    fn release(&self, gate: &Arc<ResourceGate<K>>);

    /// Look at the current gate for `id` without taking a reference
    fn peek(&self, id: &K) -> Option<Arc<ResourceGate<K>>>;

    /// Number of gates currently held
    fn len(&self) -> usize;

    /// Whether no gates are held
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a gate for `id` is currently held
    fn contains(&self, id: &K) -> bool;

    /// Number of independently locked shards
    fn shard_count(&self) -> usize;

    /// The implementation kind
    fn kind(&self) -> RegistryKind;

    /// The factory used for new gates
    fn factory(&self) -> GateFactory;
}

/// Registry that evicts a gate when its last reference is released
pub struct RefCountedRegistry<K> {
    name: Arc<str>,
    factory: GateFactory,
    gates: ShardedMap<K, Arc<ResourceGate<K>>>,
}

impl<K: ResourceKey> RefCountedRegistry<K> {
    /// Create a registry with `concurrency_level` shards
    pub fn new(factory: GateFactory, concurrency_level: usize) -> Self {
        Self {
            name: Arc::from("registry"),
            factory,
            gates: ShardedMap::new(concurrency_level),
        }
    }

    /// Set the name reported in log events
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }
}

impl<K: ResourceKey> ResourceRegistry<K> for RefCountedRegistry<K> {
    fn get(&self, id: &K) -> Arc<ResourceGate<K>> {
        let shard = self.gates.shard(id);

        // Optimistic path: a live gate has a positive count before our increment
        let touched = {
            let map = shard.read();
            match map.get(id) {
                Some(gate) => {
                    if gate.retain() > 0 {
                        trace!(checkpoint = %self.name, resource = ?id, "gate found");
                        return gate.clone();
                    }
                    Some(gate.clone())
                }
                None => None,
            }
        };

        let mut map = shard.write();
        if let Some(current) = map.get(id) {
            let counted = touched
                .as_ref()
                .map_or(false, |gate| Arc::ptr_eq(gate, current));
            if !counted {
                current.retain();
            }
            trace!(checkpoint = %self.name, resource = ?id, "gate revived");
            return current.clone();
        }

        let gate = Arc::new(self.factory.create(id.clone()));
        map.insert(id.clone(), gate.clone());
        debug!(
            checkpoint = %self.name,
            resource = ?id,
            capacity = self.factory.capacity(),
            "gate created"
        );
        gate
    }

    fn release(&self, gate: &Arc<ResourceGate<K>>) {
        if gate.unretain() > 0 {
            return;
        }

        let id = gate.resource_id();
        let mut map = self.gates.shard(id).write();
        let present = map.get(id).map_or(false, |current| Arc::ptr_eq(current, gate));
        if present && gate.try_retire() {
            map.remove(id);
            debug!(checkpoint = %self.name, resource = ?id, "gate evicted");
        }
    }

    fn peek(&self, id: &K) -> Option<Arc<ResourceGate<K>>> {
        self.gates.get_cloned(id)
    }

    fn len(&self) -> usize {
        self.gates.len()
    }

    fn contains(&self, id: &K) -> bool {
        self.gates.contains_key(id)
    }

    fn shard_count(&self) -> usize {
        self.gates.shard_count()
    }

    fn kind(&self) -> RegistryKind {
        RegistryKind::RefCounted
    }

    fn factory(&self) -> GateFactory {
        self.factory
    }
}

impl<K: ResourceKey> fmt::Debug for RefCountedRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountedRegistry")
            .field("name", &self.name)
            .field("factory", &self.factory)
            .field("gates", &self.gates.len())
            .finish()
    }
}

/// Registry that keeps every gate it ever created
///
/// Lookups skip all reference counting. Memory grows with the number of
/// distinct ids, so use it only for a bounded set of ids.
pub struct PinnedRegistry<K> {
    name: Arc<str>,
    factory: GateFactory,
    gates: ShardedMap<K, Arc<ResourceGate<K>>>,
}

impl<K: ResourceKey> PinnedRegistry<K> {
    /// Create a registry with `concurrency_level` shards
    pub fn new(factory: GateFactory, concurrency_level: usize) -> Self {
        Self {
            name: Arc::from("registry"),
            factory,
            gates: ShardedMap::new(concurrency_level),
        }
    }

    /// Set the name reported in log events
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }
}

impl<K: ResourceKey> ResourceRegistry<K> for PinnedRegistry<K> {
    fn get(&self, id: &K) -> Arc<ResourceGate<K>> {
        if let Some(gate) = self.gates.get_cloned(id) {
            return gate;
        }

        let mut map = self.gates.shard(id).write();
        map.entry(id.clone())
            .or_insert_with(|| {
                debug!(checkpoint = %self.name, resource = ?id, "gate pinned");
                Arc::new(self.factory.create(id.clone()))
            })
            .clone()
    }

    fn release(&self, _gate: &Arc<ResourceGate<K>>) {}

    fn peek(&self, id: &K) -> Option<Arc<ResourceGate<K>>> {
        self.gates.get_cloned(id)
    }

    fn len(&self) -> usize {
        self.gates.len()
    }

    fn contains(&self, id: &K) -> bool {
        self.gates.contains_key(id)
    }

    fn shard_count(&self) -> usize {
        self.gates.shard_count()
    }

    fn kind(&self) -> RegistryKind {
        RegistryKind::Pinned
    }

    fn factory(&self) -> GateFactory {
        self.factory
    }
}

impl<K: ResourceKey> fmt::Debug for PinnedRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedRegistry")
            .field("name", &self.name)
            .field("factory", &self.factory)
            .field("gates", &self.gates.len())
            .finish()
    }
}
