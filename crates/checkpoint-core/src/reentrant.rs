// Reentrant checkpoint
//
// Wraps a `SimpleCheckpoint` and remembers, per caller and resource id, how
// deeply the caller has entered. Only the outermost entry touches the
// registry, the gate and the global limiter; nested entries hand out new
// handles to the same grant, and the grant is released when the outermost
// handle is.

use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use tracing::{error, trace, warn};

use crate::checkpoint::{Checkpoint, SimpleCheckpoint};
use crate::error::{CheckpointError, Result};
use crate::gate::{AccessMode, ResourceKey};
use crate::pass::{Pass, PassSink, Ticket};
use crate::semaphore::WaitPolicy;
use crate::shard::ShardedMap;

/// Identifies the caller on whose behalf a pass is acquired
///
/// Two callers that may run at the same time must never report the same
/// id, otherwise they share each other's grants.
pub trait CallerContext: Send + Sync + 'static {
    /// Caller identifier
    type Id: Hash + Eq + Clone + Debug + Send + Sync + 'static;

    /// The id of the calling context
    fn current(&self) -> Self::Id;
}

/// Identifies callers by OS thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadCaller;

impl CallerContext for ThreadCaller {
    type Id = ThreadId;

    fn current(&self) -> ThreadId {
        thread::current().id()
    }
}

/// Checkpoint allowing a caller to re-enter resources it already holds
///
/// A caller holding a shared pass may not ask for an exclusive pass to the
/// same resource; that fails with
/// [`CheckpointError::UnsupportedEscalation`]. The reverse is allowed and
/// yields another handle to the exclusive grant.
pub struct ReentrantCheckpoint<K: ResourceKey, C: CallerContext = ThreadCaller> {
    core: Arc<ReentrantCore<K, C>>,
}

struct ReentrantCore<K: ResourceKey, C: CallerContext> {
    inner: SimpleCheckpoint<K>,
    caller: C,
    entries: ShardedMap<(C::Id, K), ReentrancyEntry<K>>,
}

struct ReentrancyEntry<K: ResourceKey> {
    count: u64,
    pass: Option<Pass<K>>,
}

/// Outcome of leaving one nesting level
enum Exit<K: ResourceKey> {
    Missing,
    Nested(u64),
    Last(Option<Pass<K>>),
}

impl<K: ResourceKey> ReentrantCheckpoint<K, ThreadCaller> {
    /// Make `inner` reentrant per thread
    pub fn new(inner: SimpleCheckpoint<K>) -> Self {
        Self::with_caller(inner, ThreadCaller)
    }
}

impl<K: ResourceKey, C: CallerContext> ReentrantCheckpoint<K, C> {
    /// Make `inner` reentrant per caller as reported by `caller`
    pub fn with_caller(inner: SimpleCheckpoint<K>, caller: C) -> Self {
        let shards = inner.registry().shard_count();
        Self {
            core: Arc::new(ReentrantCore {
                inner,
                caller,
                entries: ShardedMap::new(shards),
            }),
        }
    }

    /// The wrapped non-reentrant checkpoint
    pub fn inner(&self) -> &SimpleCheckpoint<K> {
        &self.core.inner
    }

    /// How many times the current caller has entered `id`
    pub fn nesting_depth(&self, id: &K) -> u64 {
        let key = (self.core.caller.current(), id.clone());
        self.core
            .entries
            .shard(&key)
            .read()
            .get(&key)
            .map_or(0, |entry| entry.count)
    }

    /// Number of (caller, resource) pairs currently tracked
    pub fn tracked_entries(&self) -> usize {
        self.core.entries.len()
    }

    fn handle(&self, ticket: Arc<Ticket<K>>, caller: C::Id) -> Pass<K> {
        let sink = ReentrantExit {
            core: self.core.clone(),
            caller,
        };
        Pass::new(ticket, Arc::new(sink))
    }
}

impl<K: ResourceKey, C: CallerContext> ReentrantCore<K, C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    /// Leave one nesting level of `key`
    ///
    /// The returned pass, if any, must be dropped after the shard lock is
    /// released, which happens on return.
    fn exit(&self, key: &(C::Id, K)) -> Exit<K> {
        let mut map = self.entries.shard(key).write();
        let remaining = match map.get_mut(key) {
            None => return Exit::Missing,
            Some(entry) => {
                entry.count -= 1;
                entry.count
            }
        };
        if remaining > 0 {
            return Exit::Nested(remaining);
        }
        Exit::Last(map.remove(key).and_then(|entry| entry.pass))
    }
}

impl<K: ResourceKey, C: CallerContext> Checkpoint<K> for ReentrantCheckpoint<K, C> {
    fn acquire(&self, id: &K, mode: AccessMode, wait: WaitPolicy) -> Result<Option<Pass<K>>> {
        let core = &self.core;
        let caller = core.caller.current();
        let key = (caller.clone(), id.clone());

        {
            let mut map = core.entries.shard(&key).write();
            let entry = map.entry(key.clone()).or_insert(ReentrancyEntry {
                count: 0,
                pass: None,
            });
            entry.count += 1;

            if let Some(held) = &entry.pass {
                if mode.is_exclusive() && held.is_shared() {
                    // The rejected call leaves the nesting state untouched
                    entry.count -= 1;
                    return Err(CheckpointError::escalation(id));
                }
                trace!(
                    checkpoint = %core.name(),
                    resource = ?id,
                    caller = ?caller,
                    depth = entry.count,
                    "reentered"
                );
                let ticket = held.ticket().clone();
                drop(map);
                return Ok(Some(self.handle(ticket, caller)));
            }
        }

        match core.inner.acquire(id, mode, wait) {
            Ok(Some(pass)) => {
                let ticket = pass.ticket().clone();
                let mut map = core.entries.shard(&key).write();
                let entry = map.entry(key).or_insert(ReentrancyEntry {
                    count: 1,
                    pass: None,
                });
                // A grant stored meanwhile wins; ours is surplus
                let stored = entry.pass.as_ref().map(|stored| stored.ticket().clone());
                let (ticket, surplus) = match stored {
                    Some(stored) => (stored, Some(pass)),
                    None => {
                        entry.pass = Some(pass);
                        (ticket, None)
                    }
                };
                drop(map);
                drop(surplus);
                Ok(Some(self.handle(ticket, caller)))
            }
            outcome => {
                if let Exit::Last(pass) = core.exit(&key) {
                    drop(pass);
                }
                outcome
            }
        }
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn global_limit(&self) -> Option<u32> {
        self.core.inner.global_limit()
    }

    fn available_global_permits(&self) -> Option<u32> {
        self.core.inner.available_global_permits()
    }
}

/// Returns one nesting level for the caller that acquired the pass
struct ReentrantExit<K: ResourceKey, C: CallerContext> {
    core: Arc<ReentrantCore<K, C>>,
    caller: C::Id,
}

impl<K: ResourceKey, C: CallerContext> PassSink<K> for ReentrantExit<K, C> {
    fn return_pass(&self, ticket: &Arc<Ticket<K>>) {
        let core = &self.core;
        let id = ticket.gate.resource_id();
        let releasing = core.caller.current();
        if releasing != self.caller {
            warn!(
                checkpoint = %core.name(),
                resource = ?id,
                owner = ?self.caller,
                releasing = ?releasing,
                "pass released by a caller that did not acquire it"
            );
        }

        match core.exit(&(self.caller.clone(), id.clone())) {
            Exit::Missing => error!(
                checkpoint = %core.name(),
                resource = ?id,
                owner = ?self.caller,
                "released pass has no reentrancy entry"
            ),
            Exit::Nested(depth) => trace!(
                checkpoint = %core.name(),
                resource = ?id,
                depth,
                "left nested entry"
            ),
            Exit::Last(pass) => {
                trace!(checkpoint = %core.name(), resource = ?id, "left outermost entry");
                drop(pass);
            }
        }
    }
}

impl<K: ResourceKey, C: CallerContext> Clone for ReentrantCheckpoint<K, C> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<K: ResourceKey, C: CallerContext> fmt::Debug for ReentrantCheckpoint<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantCheckpoint")
            .field("inner", &self.core.inner)
            .field("tracked_entries", &self.tracked_entries())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateFactory;
    use crate::registry::RefCountedRegistry;
    use std::cell::Cell;

    fn checkpoint(capacity: u32, global_limit: Option<u32>) -> ReentrantCheckpoint<&'static str> {
        let registry = Arc::new(RefCountedRegistry::new(GateFactory::new(capacity, false), 4));
        ReentrantCheckpoint::new(SimpleCheckpoint::new("test", registry, global_limit, false))
    }

    #[test]
    fn test_nested_shared_entries_share_one_grant() {
        let checkpoint = checkpoint(2, Some(10));
        let outer = checkpoint.shared(&"a").unwrap();
        let middle = checkpoint.shared(&"a").unwrap();
        let inner = checkpoint.shared(&"a").unwrap();

        assert!(outer.same_grant(&middle));
        assert!(outer.same_grant(&inner));
        assert_eq!(checkpoint.nesting_depth(&"a"), 3);
        assert_eq!(checkpoint.available_global_permits(), Some(9));
        let gate = checkpoint.inner().registry().peek(&"a").unwrap();
        assert_eq!(gate.available_permits(), 1);

        drop(inner);
        drop(middle);
        assert_eq!(checkpoint.nesting_depth(&"a"), 1);
        assert_eq!(gate.available_permits(), 1);

        drop(outer);
        assert_eq!(checkpoint.nesting_depth(&"a"), 0);
        assert_eq!(checkpoint.tracked_entries(), 0);
        assert_eq!(checkpoint.available_global_permits(), Some(10));
        assert!(checkpoint.inner().registry().is_empty());
    }

    #[test]
    fn test_exclusive_then_shared_is_allowed() {
        let checkpoint = checkpoint(3, None);
        let exclusive = checkpoint.exclusive(&"a").unwrap();
        let shared = checkpoint.shared(&"a").unwrap();

        assert!(shared.is_exclusive(), "mode is fixed by the first entry");
        assert!(exclusive.same_grant(&shared));
    }

    #[test]
    fn test_shared_then_exclusive_is_rejected_without_damage() {
        let checkpoint = checkpoint(3, None);
        let shared = checkpoint.shared(&"a").unwrap();

        let err = checkpoint.exclusive(&"a").unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedEscalation { .. }));
        assert!(checkpoint.try_exclusive(&"a").is_err());
        assert_eq!(checkpoint.nesting_depth(&"a"), 1);

        drop(shared);
        assert_eq!(checkpoint.tracked_entries(), 0);
        assert!(checkpoint.try_exclusive(&"a").unwrap().is_some());
    }

    #[test]
    fn test_failed_first_entry_is_undone() {
        let checkpoint = checkpoint(1, None);
        let other = checkpoint.clone();
        let holder = thread::spawn(move || {
            let pass = other.exclusive(&"a").unwrap();
            std::mem::forget(pass);
        });
        holder.join().unwrap();

        assert!(checkpoint.try_shared(&"a").unwrap().is_none());
        assert_eq!(checkpoint.nesting_depth(&"a"), 0);
        assert_eq!(checkpoint.tracked_entries(), 1, "only the other thread's entry");
    }

    #[test]
    fn test_callers_are_isolated() {
        let checkpoint = checkpoint(1, None);
        let _held = checkpoint.exclusive(&"a").unwrap();

        let other = checkpoint.clone();
        let attempt = thread::spawn(move || other.try_shared(&"a").unwrap().is_some());
        assert!(!attempt.join().unwrap());
    }

    thread_local! {
        static TASK: Cell<u32> = Cell::new(0);
    }

    struct TaskCaller;

    impl CallerContext for TaskCaller {
        type Id = u32;

        fn current(&self) -> u32 {
            TASK.with(Cell::get)
        }
    }

    #[test]
    fn test_custom_caller_context_and_foreign_release() {
        let registry = Arc::new(RefCountedRegistry::new(GateFactory::new(1, false), 1));
        let checkpoint = ReentrantCheckpoint::with_caller(
            SimpleCheckpoint::new("tasks", registry, None, false),
            TaskCaller,
        );

        TASK.with(|task| task.set(1));
        let first = checkpoint.exclusive(&"a").unwrap();
        let nested = checkpoint.exclusive(&"a").unwrap();
        assert_eq!(checkpoint.nesting_depth(&"a"), 2);

        TASK.with(|task| task.set(2));
        assert!(checkpoint.try_exclusive(&"a").unwrap().is_none());
        assert_eq!(checkpoint.nesting_depth(&"a"), 0);

        // Released by task 2, still applied to task 1's entry
        drop(nested);
        TASK.with(|task| task.set(1));
        assert_eq!(checkpoint.nesting_depth(&"a"), 1);

        drop(first);
        assert_eq!(checkpoint.tracked_entries(), 0);
        assert!(checkpoint.inner().registry().is_empty());
    }
}
