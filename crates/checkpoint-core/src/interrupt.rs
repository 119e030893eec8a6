// Thread interruption
//
// Every thread owns an interrupt flag. Another thread can raise it through
// an `Interrupter` handle; if the target is parked on a semaphore of this
// crate it is woken up and its blocking acquisition fails with
// `CheckpointError::Interrupted`, clearing the flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Something a parked thread can be woken from
pub(crate) trait Unpark: Send + Sync {
    /// Wake every thread parked on this object so it re-checks its state
    fn unpark(&self);
}

thread_local! {
    static CURRENT: Interrupter = Interrupter::new();
}

/// Handle to a thread's interrupt flag
///
/// Obtain one for the calling thread with [`Interrupter::current`] and hand
/// it to whichever thread should be able to interrupt it.
#[derive(Clone)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

struct InterruptState {
    raised: AtomicBool,
    parked_on: Mutex<Option<Weak<dyn Unpark>>>,
}

impl Interrupter {
    fn new() -> Self {
        Self {
            state: Arc::new(InterruptState {
                raised: AtomicBool::new(false),
                parked_on: Mutex::new(None),
            }),
        }
    }

    /// The interrupt handle of the calling thread
    pub fn current() -> Self {
        CURRENT.with(Interrupter::clone)
    }

    /// Raise the flag and wake the owning thread if it is waiting for permits
    pub fn interrupt(&self) {
        self.state.raised.store(true, Ordering::SeqCst);
        let target = self.state.parked_on.lock().as_ref().and_then(Weak::upgrade);
        if let Some(target) = target {
            target.unpark();
        }
    }

    /// Whether the flag is raised, without clearing it
    pub fn is_interrupted(&self) -> bool {
        self.state.raised.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was raised
    pub(crate) fn take(&self) -> bool {
        self.state.raised.swap(false, Ordering::SeqCst)
    }

    /// Record what the owning thread is about to wait on
    ///
    /// Must be called before the waiter checks the flag under its own lock,
    /// so that a concurrent `interrupt` either is seen by that check or
    /// finds the registration and wakes the waiter.
    pub(crate) fn park_on(&self, target: Weak<dyn Unpark>) -> ParkRegistration<'_> {
        *self.state.parked_on.lock() = Some(target);
        ParkRegistration { interrupter: self }
    }

    /// Whether both handles refer to the same thread's flag
    pub fn same_thread(&self, other: &Interrupter) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter")
            .field("raised", &self.is_interrupted())
            .finish()
    }
}

/// Clears the park registration when the wait ends
pub(crate) struct ParkRegistration<'a> {
    interrupter: &'a Interrupter,
}

impl Drop for ParkRegistration<'_> {
    fn drop(&mut self) {
        *self.interrupter.state.parked_on.lock() = None;
    }
}

/// Test and clear the calling thread's interrupt flag
pub fn interrupted() -> bool {
    Interrupter::current().take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct CountingTarget(AtomicUsize);

    impl Unpark for CountingTarget {
        fn unpark(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_flag_is_per_thread() {
        let here = Interrupter::current();
        let there = thread::spawn(Interrupter::current).join().unwrap();

        assert!(!here.same_thread(&there));
        assert!(here.same_thread(&Interrupter::current()));

        there.interrupt();
        assert!(there.is_interrupted());
        assert!(!here.is_interrupted());
    }

    #[test]
    fn test_interrupted_clears_flag() {
        Interrupter::current().interrupt();
        assert!(Interrupter::current().is_interrupted());
        assert!(interrupted());
        assert!(!interrupted());
    }

    #[test]
    fn test_interrupt_wakes_parked_target() {
        let target = Arc::new(CountingTarget(AtomicUsize::new(0)));
        let weak: Weak<dyn Unpark> = Arc::downgrade(&target) as Weak<CountingTarget>;
        let interrupter = Interrupter::current();

        {
            let _registration = interrupter.park_on(weak);
            interrupter.interrupt();
            assert_eq!(target.0.load(Ordering::SeqCst), 1);
        }

        // Registration is gone, so a second interrupt only raises the flag
        interrupter.interrupt();
        assert_eq!(target.0.load(Ordering::SeqCst), 1);
        assert!(interrupted());
    }
}
