// Resource gates
//
// A gate owns the permit pool of one resource id. Shared passes take one
// permit, exclusive passes take all of them, which makes the two modes
// mutually exclusive. The gate also carries the reference count its
// registry uses to decide when the gate can be evicted.

use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::error::Result;
use crate::semaphore::{Semaphore, WaitPolicy};

/// Bound for values usable as resource identifiers
pub trait ResourceKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T> ResourceKey for T where T: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

/// The access mode of a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read-only access; up to `capacity` holders at once
    Shared,
    /// Read-write access; a single holder and no shared holders
    Exclusive,
}

impl AccessMode {
    /// Whether this is shared (read-only) access
    pub fn is_shared(self) -> bool {
        matches!(self, Self::Shared)
    }

    /// Whether this is exclusive (read-write) access
    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::Exclusive)
    }
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Reference count value marking a gate that has left its registry
const RETIRED: i64 = i64::MIN / 2;

/// Permit pool for a single resource id
pub struct ResourceGate<K> {
    resource_id: K,
    capacity: u32,
    permits: Semaphore,
    ref_count: AtomicI64,
}

impl<K> ResourceGate<K> {
    /// Create a gate with `capacity` permits and a reference count of one
    pub fn new(resource_id: K, capacity: u32, fair: bool) -> Self {
        debug_assert!(capacity >= 1, "gate capacity must be at least 1");
        let capacity = capacity.max(1);
        Self {
            resource_id,
            capacity,
            permits: Semaphore::new(capacity, fair),
            ref_count: AtomicI64::new(1),
        }
    }

    /// The resource this gate guards
    pub fn resource_id(&self) -> &K {
        &self.resource_id
    }

    /// Maximum number of concurrent shared holders
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Whether waiters are served in arrival order
    pub fn is_fair(&self) -> bool {
        self.permits.is_fair()
    }

    /// Permits not currently held
    pub fn available_permits(&self) -> u32 {
        self.permits.available_permits()
    }

    /// Threads parked waiting on this gate
    pub fn queued_waiters(&self) -> usize {
        self.permits.queue_len()
    }

    fn permits_for(&self, mode: AccessMode) -> u32 {
        match mode {
            AccessMode::Shared => 1,
            AccessMode::Exclusive => self.capacity,
        }
    }

    /// Block until the permits for `mode` are taken, or the thread is interrupted
    pub fn acquire(&self, mode: AccessMode) -> Result<()> {
        self.permits.acquire(self.permits_for(mode))
    }

    /// Block until the permits for `mode` are taken
    pub fn acquire_uninterruptibly(&self, mode: AccessMode) {
        self.permits.acquire_uninterruptibly(self.permits_for(mode))
    }

    /// Take the permits for `mode` if they are free right now
    pub fn try_acquire(&self, mode: AccessMode) -> bool {
        self.permits.try_acquire(self.permits_for(mode))
    }

    /// Take the permits for `mode`, waiting at most `timeout`
    pub fn try_acquire_for(&self, mode: AccessMode, timeout: Duration) -> Result<bool> {
        self.permits.try_acquire_for(self.permits_for(mode), timeout)
    }

    /// Take the permits for `mode` under any wait policy
    pub fn acquire_with(&self, mode: AccessMode, wait: WaitPolicy) -> Result<bool> {
        self.permits.acquire_with(self.permits_for(mode), wait)
    }

    /// Return the permits held for `mode`
    ///
    /// The caller must actually hold them; passes track this.
    pub fn release(&self, mode: AccessMode) {
        self.permits.release(self.permits_for(mode))
    }

    /// Current reference count
    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Increment the reference count, returning the previous value
    pub(crate) fn retain(&self) -> i64 {
        self.ref_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Decrement the reference count, returning the new value
    pub(crate) fn unretain(&self) -> i64 {
        self.ref_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Mark the gate as evicted if nobody holds a reference
    ///
    /// Called under the registry's shard lock. A retired gate keeps a
    /// deeply negative count so late optimistic increments can never see
    /// a positive value and hand it out again.
    pub(crate) fn try_retire(&self) -> bool {
        let mut current = self.ref_count.load(Ordering::SeqCst);
        loop {
            if current > 0 {
                return false;
            }
            match self.ref_count.compare_exchange(
                current,
                RETIRED,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl<K: Debug> Debug for ResourceGate<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGate")
            .field("resource_id", &self.resource_id)
            .field("capacity", &self.capacity)
            .field("available", &self.available_permits())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// Creates gates with a fixed capacity and fairness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateFactory {
    capacity: u32,
    fair: bool,
}

impl GateFactory {
    /// Create a factory for gates with `capacity` permits
    pub fn new(capacity: u32, fair: bool) -> Self {
        Self { capacity, fair }
    }

    /// Permits per created gate
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Fairness of created gates
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// Build a fresh gate for `resource_id`
    pub fn create<K>(&self, resource_id: K) -> ResourceGate<K> {
        ResourceGate::new(resource_id, self.capacity, self.fair)
    }
}

impl Default for GateFactory {
    fn default() -> Self {
        Self::new(1, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_and_exclusive_are_mutually_exclusive() {
        let gate = ResourceGate::new("disk", 3, false);

        assert!(gate.try_acquire(AccessMode::Shared));
        assert!(gate.try_acquire(AccessMode::Shared));
        assert!(!gate.try_acquire(AccessMode::Exclusive));
        assert_eq!(gate.available_permits(), 1);

        gate.release(AccessMode::Shared);
        gate.release(AccessMode::Shared);
        assert!(gate.try_acquire(AccessMode::Exclusive));
        assert!(!gate.try_acquire(AccessMode::Shared));
        assert_eq!(gate.available_permits(), 0);

        gate.release(AccessMode::Exclusive);
        assert_eq!(gate.available_permits(), 3);
    }

    #[test]
    fn test_shared_capacity_limit() {
        let gate = ResourceGate::new(7u64, 2, true);
        assert!(gate.try_acquire(AccessMode::Shared));
        assert!(gate.try_acquire(AccessMode::Shared));
        assert!(!gate.try_acquire_for(AccessMode::Shared, Duration::from_millis(10)).unwrap());
        assert!(gate.is_fair());
    }

    #[test]
    fn test_reference_counting_and_retirement() {
        let gate = ResourceGate::new("r", 1, false);
        assert_eq!(gate.ref_count(), 1);

        assert_eq!(gate.retain(), 1);
        assert!(!gate.try_retire());
        assert_eq!(gate.unretain(), 1);
        assert_eq!(gate.unretain(), 0);

        assert!(gate.try_retire());
        // A late optimistic increment still observes a non-positive count
        assert!(gate.retain() <= 0);
        assert!(gate.ref_count() <= 0);
    }

    #[test]
    fn test_factory_builds_configured_gates() {
        let factory = GateFactory::new(4, true);
        let gate = factory.create("printer".to_string());
        assert_eq!(gate.capacity(), 4);
        assert!(gate.is_fair());
        assert_eq!(gate.resource_id(), "printer");
        assert_eq!(gate.available_permits(), 4);
    }

    #[test]
    fn test_access_mode_display() {
        assert_eq!(AccessMode::Shared.to_string(), "shared");
        assert_eq!(AccessMode::Exclusive.to_string(), "exclusive");
        assert!(AccessMode::Shared.is_shared());
        assert!(AccessMode::Exclusive.is_exclusive());
    }
}
