// Checkpoint protocol
//
// A checkpoint hands out shared and exclusive passes per resource id. Each
// mode comes in four flavours (blocking, uninterruptible, immediate and
// timed), all of which funnel into `Checkpoint::acquire`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::Result;
use crate::gate::{AccessMode, ResourceKey};
use crate::pass::{Pass, PassSink, Ticket};
use crate::registry::ResourceRegistry;
use crate::semaphore::{Semaphore, WaitPolicy};

/// Shared/exclusive access control keyed by resource id
pub trait Checkpoint<K: ResourceKey>: Send + Sync {
    /// Acquire a pass for `id` in `mode` under the given wait policy
    ///
    /// Returns `Ok(None)` when an immediate or timed request finds no
    /// capacity. Nothing is held after an `Ok(None)` or an error.
    fn acquire(&self, id: &K, mode: AccessMode, wait: WaitPolicy) -> Result<Option<Pass<K>>>;

    /// Diagnostic name
    fn name(&self) -> &str;

    /// Cap on outstanding passes across all ids, if any
    fn global_limit(&self) -> Option<u32>;

    /// Admissions left under the global cap, if any
    fn available_global_permits(&self) -> Option<u32>;

    /// Shared pass, blocking until granted or interrupted
    fn shared(&self, id: &K) -> Result<Pass<K>> {
        self.acquire(id, AccessMode::Shared, WaitPolicy::Interruptible)
            .map(granted)
    }

    /// Shared pass, blocking until granted
    fn shared_uninterruptibly(&self, id: &K) -> Result<Pass<K>> {
        self.acquire(id, AccessMode::Shared, WaitPolicy::Uninterruptible)
            .map(granted)
    }

    /// Shared pass if one is available right now
    fn try_shared(&self, id: &K) -> Result<Option<Pass<K>>> {
        self.acquire(id, AccessMode::Shared, WaitPolicy::Immediate)
    }

    /// Shared pass, waiting at most `timeout` per stage
    fn try_shared_for(&self, id: &K, timeout: Duration) -> Result<Option<Pass<K>>> {
        self.acquire(id, AccessMode::Shared, WaitPolicy::Timeout(timeout))
    }

    /// Exclusive pass, blocking until granted or interrupted
    fn exclusive(&self, id: &K) -> Result<Pass<K>> {
        self.acquire(id, AccessMode::Exclusive, WaitPolicy::Interruptible)
            .map(granted)
    }

    /// Exclusive pass, blocking until granted
    fn exclusive_uninterruptibly(&self, id: &K) -> Result<Pass<K>> {
        self.acquire(id, AccessMode::Exclusive, WaitPolicy::Uninterruptible)
            .map(granted)
    }

    /// Exclusive pass if one is available right now
    fn try_exclusive(&self, id: &K) -> Result<Option<Pass<K>>> {
        self.acquire(id, AccessMode::Exclusive, WaitPolicy::Immediate)
    }

    /// Exclusive pass, waiting at most `timeout` per stage
    fn try_exclusive_for(&self, id: &K, timeout: Duration) -> Result<Option<Pass<K>>> {
        self.acquire(id, AccessMode::Exclusive, WaitPolicy::Timeout(timeout))
    }

    /// Run `f` while holding a shared pass for `id`
    ///
    /// The pass is released when `f` returns or unwinds.
    fn with_shared<T, F>(&self, id: &K, f: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce(&Pass<K>) -> T,
    {
        let pass = self.shared(id)?;
        Ok(f(&pass))
    }

    /// Run `f` while holding an exclusive pass for `id`
    ///
    /// The pass is released when `f` returns or unwinds.
    fn with_exclusive<T, F>(&self, id: &K, f: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce(&Pass<K>) -> T,
    {
        let pass = self.exclusive(id)?;
        Ok(f(&pass))
    }
}

fn granted<K: ResourceKey>(pass: Option<Pass<K>>) -> Pass<K> {
    match pass {
        Some(pass) => pass,
        None => unreachable!("blocking acquisition returned without a pass"),
    }
}

/// Non-reentrant checkpoint
///
/// Every call is a separate admission: a caller asking twice for an
/// exclusive pass to the same id deadlocks with itself. Use
/// [`ReentrantCheckpoint`](crate::reentrant::ReentrantCheckpoint) for
/// nested access.
pub struct SimpleCheckpoint<K: ResourceKey> {
    core: Arc<SimpleCore<K>>,
}

struct SimpleCore<K: ResourceKey> {
    name: Arc<str>,
    registry: Arc<dyn ResourceRegistry<K>>,
    global_limit: Option<u32>,
    limiter: Option<Semaphore>,
}

impl<K: ResourceKey> SimpleCheckpoint<K> {
    /// Create a checkpoint over `registry`
    ///
    /// `global_limit` caps outstanding passes across all ids; `global_fair`
    /// makes that cap serve waiters in arrival order.
    pub fn new(
        name: impl Into<Arc<str>>,
        registry: Arc<dyn ResourceRegistry<K>>,
        global_limit: Option<u32>,
        global_fair: bool,
    ) -> Self {
        let limiter = global_limit.map(|limit| Semaphore::new(limit, global_fair));
        Self {
            core: Arc::new(SimpleCore {
                name: name.into(),
                registry,
                global_limit,
                limiter,
            }),
        }
    }

    /// The registry holding this checkpoint's gates
    pub fn registry(&self) -> &Arc<dyn ResourceRegistry<K>> {
        &self.core.registry
    }
}

impl<K: ResourceKey> Checkpoint<K> for SimpleCheckpoint<K> {
    fn acquire(&self, id: &K, mode: AccessMode, wait: WaitPolicy) -> Result<Option<Pass<K>>> {
        let core = &self.core;
        let gate = core.registry.get(id);

        match gate.acquire_with(mode, wait) {
            Ok(true) => {}
            Ok(false) => {
                core.registry.release(&gate);
                trace!(checkpoint = %core.name, resource = ?id, %mode, "no local capacity");
                return Ok(None);
            }
            Err(err) => {
                core.registry.release(&gate);
                return Err(err);
            }
        }

        if let Some(limiter) = &core.limiter {
            let admitted = limiter.acquire_with(1, wait);
            if !matches!(admitted, Ok(true)) {
                // Only the local stage succeeded, so only it is unwound
                gate.release(mode);
                core.registry.release(&gate);
                debug!(
                    checkpoint = %core.name,
                    resource = ?id,
                    %mode,
                    "global limit refused admission, local permit returned"
                );
                return admitted.map(|_| None);
            }
        }

        trace!(checkpoint = %core.name, resource = ?id, %mode, "pass granted");
        let ticket = Arc::new(Ticket {
            gate,
            mode,
            checkpoint: core.name.clone(),
        });
        Ok(Some(Pass::new(ticket, core.clone())))
    }

    fn name(&self) -> &str {
        &self.core.name
    }

    fn global_limit(&self) -> Option<u32> {
        self.core.global_limit
    }

    fn available_global_permits(&self) -> Option<u32> {
        self.core.limiter.as_ref().map(Semaphore::available_permits)
    }
}

impl<K: ResourceKey> PassSink<K> for SimpleCore<K> {
    fn return_pass(&self, ticket: &Arc<Ticket<K>>) {
        if let Some(limiter) = &self.limiter {
            limiter.release(1);
        }
        ticket.gate.release(ticket.mode);
        self.registry.release(&ticket.gate);
        trace!(
            checkpoint = %self.name,
            resource = ?ticket.gate.resource_id(),
            mode = %ticket.mode,
            "pass released"
        );
    }
}

impl<K: ResourceKey> Clone for SimpleCheckpoint<K> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<K: ResourceKey> fmt::Debug for SimpleCheckpoint<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleCheckpoint")
            .field("name", &self.core.name)
            .field("registry", &self.core.registry.kind())
            .field("gates", &self.core.registry.len())
            .field("global_limit", &self.core.global_limit)
            .finish()
    }
}
