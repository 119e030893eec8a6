// Sharded hash map
//
// Spreads keys over a fixed number of independently locked maps so that
// threads working on different keys rarely contend on the same lock.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

use parking_lot::RwLock;

/// Default number of shards
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 16;

pub(crate) struct ShardedMap<K, V> {
    shards: Box<[RwLock<HashMap<K, V>>]>,
    hasher: RandomState,
}

impl<K: Hash + Eq, V> ShardedMap<K, V> {
    /// Create a map with `shard_count` shards (at least one)
    pub(crate) fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The shard responsible for `key`
    pub(crate) fn shard<Q>(&self, key: &Q) -> &RwLock<HashMap<K, V>>
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Total number of entries across all shards
    pub(crate) fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.shard(key).read().contains_key(key)
    }
}

impl<K: Hash + Eq, V: Clone> ShardedMap<K, V> {
    /// Clone the value stored for `key`
    pub(crate) fn get_cloned(&self, key: &K) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_land_in_a_stable_shard() {
        let map: ShardedMap<u32, &str> = ShardedMap::new(4);
        assert_eq!(map.shard_count(), 4);

        map.shard(&1).write().insert(1, "one");
        map.shard(&2).write().insert(2, "two");

        assert_eq!(map.len(), 2);
        assert!(map.contains_key(&1));
        assert_eq!(map.get_cloned(&2), Some("two"));
        assert_eq!(map.get_cloned(&3), None);
    }

    #[test]
    fn test_zero_shards_rounds_up_to_one() {
        let map: ShardedMap<String, u8> = ShardedMap::new(0);
        assert_eq!(map.shard_count(), 1);
    }
}
