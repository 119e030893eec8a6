// Counting semaphore
//
// The permit primitive behind resource gates and the global admission
// limiter. Supports multi-permit acquisition, FIFO fairness, timeouts and
// interruption through the calling thread's `Interrupter`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{CheckpointError, Result};
use crate::interrupt::{Interrupter, Unpark};

/// How long an acquisition is willing to wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Block until granted; fail if the thread is interrupted
    Interruptible,
    /// Block until granted, ignoring interruption
    Uninterruptible,
    /// Never block
    Immediate,
    /// Block for at most the given duration; fail if the thread is interrupted
    Timeout(Duration),
}

/// A counting semaphore
pub struct Semaphore {
    core: Arc<SemaphoreCore>,
}

struct SemaphoreCore {
    state: Mutex<SemaphoreState>,
    changed: Condvar,
    fair: bool,
}

#[derive(Debug)]
struct SemaphoreState {
    permits: u32,
    /// Tickets of parked waiters in arrival order
    queue: VecDeque<u64>,
    next_ticket: u64,
}

impl SemaphoreState {
    fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        self.queue.push_back(ticket);
        ticket
    }

    fn dequeue(&mut self, ticket: u64) {
        if let Some(position) = self.queue.iter().position(|t| *t == ticket) {
            self.queue.remove(position);
        }
    }

    fn grantable(&self, ticket: u64, permits: u32, fair: bool) -> bool {
        self.permits >= permits && (!fair || self.queue.front() == Some(&ticket))
    }
}

impl Unpark for SemaphoreCore {
    fn unpark(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }
}

impl Semaphore {
    /// Create a semaphore with `permits` available permits
    pub fn new(permits: u32, fair: bool) -> Self {
        Self {
            core: Arc::new(SemaphoreCore {
                state: Mutex::new(SemaphoreState {
                    permits,
                    queue: VecDeque::new(),
                    next_ticket: 0,
                }),
                changed: Condvar::new(),
                fair,
            }),
        }
    }

    /// Whether waiters are served in arrival order
    pub fn is_fair(&self) -> bool {
        self.core.fair
    }

    /// Number of permits currently available
    pub fn available_permits(&self) -> u32 {
        self.core.state.lock().permits
    }

    /// Number of threads currently parked waiting for permits
    pub fn queue_len(&self) -> usize {
        self.core.state.lock().queue.len()
    }

    /// Acquire `permits`, blocking until available or interrupted
    pub fn acquire(&self, permits: u32) -> Result<()> {
        self.acquire_with(permits, WaitPolicy::Interruptible).map(|_| ())
    }

    /// Acquire `permits`, blocking until available
    pub fn acquire_uninterruptibly(&self, permits: u32) {
        // Without an interrupter or deadline the wait always succeeds
        let _ = self.wait(permits, None, None);
    }

    /// Acquire `permits` only if they are available right now
    ///
    /// Like most semaphores this barges ahead of parked waiters even when
    /// the semaphore is fair.
    pub fn try_acquire(&self, permits: u32) -> bool {
        let mut state = self.core.state.lock();
        if state.permits >= permits {
            state.permits -= permits;
            true
        } else {
            false
        }
    }

    /// Acquire `permits`, waiting at most `timeout`
    pub fn try_acquire_for(&self, permits: u32, timeout: Duration) -> Result<bool> {
        self.acquire_with(permits, WaitPolicy::Timeout(timeout))
    }

    /// Acquire `permits` under the given wait policy
    ///
    /// Returns `Ok(false)` when an immediate or timed request could not be
    /// satisfied.
    pub fn acquire_with(&self, permits: u32, wait: WaitPolicy) -> Result<bool> {
        match wait {
            WaitPolicy::Interruptible => {
                self.wait(permits, None, Some(&Interrupter::current()))
            }
            WaitPolicy::Uninterruptible => {
                self.acquire_uninterruptibly(permits);
                Ok(true)
            }
            WaitPolicy::Immediate => Ok(self.try_acquire(permits)),
            WaitPolicy::Timeout(timeout) => {
                // An unrepresentable deadline waits without a time bound
                let deadline = Instant::now().checked_add(timeout);
                self.wait(permits, deadline, Some(&Interrupter::current()))
            }
        }
    }

    /// Return `permits` to the semaphore, waking parked waiters
    pub fn release(&self, permits: u32) {
        let mut state = self.core.state.lock();
        state.permits = state.permits.saturating_add(permits);
        if !state.queue.is_empty() {
            self.core.changed.notify_all();
        }
    }

    fn wait(
        &self,
        permits: u32,
        deadline: Option<Instant>,
        interrupter: Option<&Interrupter>,
    ) -> Result<bool> {
        let core = &self.core;
        let _registration = interrupter.map(|i| {
            let target: Weak<SemaphoreCore> = Arc::downgrade(core);
            i.park_on(target)
        });

        let mut state = core.state.lock();
        if interrupter.map_or(false, Interrupter::take) {
            return Err(CheckpointError::Interrupted);
        }
        if state.permits >= permits && (!core.fair || state.queue.is_empty()) {
            state.permits -= permits;
            return Ok(true);
        }

        let ticket = state.enqueue();
        loop {
            if interrupter.map_or(false, Interrupter::take) {
                state.dequeue(ticket);
                core.changed.notify_all();
                return Err(CheckpointError::Interrupted);
            }
            if state.grantable(ticket, permits, core.fair) {
                state.dequeue(ticket);
                state.permits -= permits;
                if core.fair && !state.queue.is_empty() {
                    // The next head may be satisfiable with what is left
                    core.changed.notify_all();
                }
                return Ok(true);
            }
            match deadline {
                None => core.changed.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        state.dequeue(ticket);
                        core.changed.notify_all();
                        return Ok(false);
                    }
                    core.changed.wait_until(&mut state, deadline);
                }
            }
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Semaphore")
            .field("permits", &state.permits)
            .field("waiters", &state.queue.len())
            .field("fair", &self.core.fair)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn wait_for_waiters(semaphore: &Semaphore, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while semaphore.queue_len() < count {
            assert!(Instant::now() < deadline, "waiters never parked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_try_acquire_and_release() {
        let semaphore = Semaphore::new(3, false);
        assert!(semaphore.try_acquire(2));
        assert!(!semaphore.try_acquire(2));
        assert!(semaphore.try_acquire(1));
        assert_eq!(semaphore.available_permits(), 0);

        semaphore.release(3);
        assert_eq!(semaphore.available_permits(), 3);
        assert!(semaphore.try_acquire(3));
    }

    #[test]
    fn test_timeout_expires_without_permits() {
        let semaphore = Semaphore::new(1, false);
        semaphore.acquire_uninterruptibly(1);

        let start = Instant::now();
        let granted = semaphore.try_acquire_for(1, Duration::from_millis(50)).unwrap();
        assert!(!granted);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(semaphore.queue_len(), 0);
    }

    #[test]
    fn test_blocking_acquire_woken_by_release() {
        let semaphore = Arc::new(Semaphore::new(2, false));
        semaphore.acquire(2).unwrap();

        let waiter = {
            let semaphore = semaphore.clone();
            thread::spawn(move || semaphore.acquire(2))
        };
        wait_for_waiters(&semaphore, 1);

        semaphore.release(1);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(semaphore.queue_len(), 1, "one permit is not enough");

        semaphore.release(1);
        waiter.join().unwrap().unwrap();
        assert_eq!(semaphore.available_permits(), 0);
    }

    #[test]
    fn test_interrupt_aborts_wait() {
        let semaphore = Arc::new(Semaphore::new(0, true));
        let (tx, rx) = mpsc::channel();

        let waiter = {
            let semaphore = semaphore.clone();
            thread::spawn(move || {
                tx.send(Interrupter::current()).unwrap();
                let result = semaphore.acquire(1);
                (result, Interrupter::current().is_interrupted())
            })
        };
        let interrupter = rx.recv().unwrap();
        wait_for_waiters(&semaphore, 1);
        interrupter.interrupt();

        let (result, still_raised) = waiter.join().unwrap();
        assert_eq!(result, Err(CheckpointError::Interrupted));
        assert!(!still_raised, "flag is cleared when the interruption is reported");
        assert_eq!(semaphore.queue_len(), 0);
    }

    #[test]
    fn test_raised_flag_fails_fast_but_not_try_acquire() {
        let semaphore = Semaphore::new(1, false);
        Interrupter::current().interrupt();

        assert!(semaphore.try_acquire(1));
        semaphore.release(1);

        assert_eq!(semaphore.acquire(1), Err(CheckpointError::Interrupted));
        assert_eq!(semaphore.available_permits(), 1);
        assert!(!Interrupter::current().is_interrupted());
    }

    #[test]
    fn test_uninterruptible_ignores_flag() {
        let semaphore = Semaphore::new(1, false);
        Interrupter::current().interrupt();
        semaphore.acquire_uninterruptibly(1);
        assert_eq!(semaphore.available_permits(), 0);
        assert!(crate::interrupt::interrupted());
    }

    #[test]
    fn test_fair_semaphore_serves_in_arrival_order() {
        let semaphore = Arc::new(Semaphore::new(0, true));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let waiter = semaphore.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                waiter.acquire_uninterruptibly(1);
                order.lock().push(i);
                waiter.release(1);
            }));
            wait_for_waiters(&semaphore, i + 1);
        }

        semaphore.release(1);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_fair_head_blocks_later_arrivals() {
        let semaphore = Arc::new(Semaphore::new(1, true));

        // Head of the queue needs two permits
        let head = {
            let semaphore = semaphore.clone();
            thread::spawn(move || semaphore.acquire_uninterruptibly(2))
        };
        wait_for_waiters(&semaphore, 1);

        // A timed request for one permit may not overtake it
        assert!(!semaphore.try_acquire_for(1, Duration::from_millis(20)).unwrap());

        semaphore.release(1);
        head.join().unwrap();
        assert_eq!(semaphore.available_permits(), 0);
    }
}
