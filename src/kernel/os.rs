//! OS primitives used across the kernel core: bounded mutex acquisition and
//! wait-queue signals.

use crate::error::{N2dError, N2dResult};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Acquires `mutex`, optionally bounded by `timeout`.
///
/// # Errors
/// `Timeout` when the lock could not be taken in time.
pub fn acquire<T>(mutex: &Mutex<T>, timeout: Option<Duration>) -> N2dResult<MutexGuard<'_, T>> {
    match timeout {
        None => Ok(mutex.lock()),
        Some(t) => mutex.try_lock_for(t).ok_or(N2dError::Timeout),
    }
}

#[derive(Debug, Default)]
struct SignalState {
    signaled: bool,
    /// Bumped by `interrupt`; a waiter aborts when it changes under it.
    generation: u64,
    /// Set by `close`; every wait, current or future, is aborted.
    closed: bool,
    waiters: usize,
}

/// A kernel wait-queue signal.
///
/// Manual-reset signals stay set until reset; auto-reset signals are consumed
/// by the waiter that observes them. An `interrupt` aborts every current
/// waiter with `Interrupted`, the way a pending process signal aborts an
/// interruptible sleep; `close` does the same for all later waits too.
#[derive(Debug)]
pub struct Signal {
    manual_reset: bool,
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl Signal {
    #[must_use]
    pub fn new(manual_reset: bool) -> Self {
        Self {
            manual_reset,
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
        }
    }

    /// Sets (`true`) or resets (`false`) the signal.
    pub fn signal(&self, state: bool) {
        let mut s = self.state.lock();
        s.signaled = state;
        if state {
            if self.manual_reset {
                self.cond.notify_all();
            } else {
                self.cond.notify_one();
            }
        }
    }

    pub fn interrupt(&self) {
        let mut s = self.state.lock();
        s.generation = s.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Interrupts the current waiters and fails every later wait.
    pub fn close(&self) {
        let mut s = self.state.lock();
        s.closed = true;
        s.generation = s.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Threads currently blocked in [`Signal::wait`].
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters
    }

    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Waits until the signal is set. `None` waits forever.
    ///
    /// # Errors
    /// `Timeout` when the deadline passes, `Interrupted` when the wait was
    /// aborted by [`Signal::interrupt`] or the signal is closed.
    pub fn wait(&self, timeout: Option<Duration>) -> N2dResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut s = self.state.lock();
        s.waiters += 1;
        let result = self.wait_locked(&mut s, deadline);
        s.waiters -= 1;
        result
    }

    fn wait_locked(
        &self,
        s: &mut MutexGuard<'_, SignalState>,
        deadline: Option<Instant>,
    ) -> N2dResult<()> {
        let generation = s.generation;

        loop {
            if s.closed || s.generation != generation {
                return Err(N2dError::Interrupted);
            }
            if s.signaled {
                if !self.manual_reset {
                    s.signaled = false;
                }
                return Ok(());
            }
            match deadline {
                None => self.cond.wait(s),
                Some(d) => {
                    if self.cond.wait_until(s, d).timed_out()
                        && !s.signaled
                        && !s.closed
                        && s.generation == generation
                    {
                        return Err(N2dError::Timeout);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn wait_for_waiters(s: &Signal, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while s.waiter_count() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn auto_reset_signal_is_consumed() {
        let s = Signal::new(false);
        s.signal(true);
        assert!(s.wait(Some(Duration::ZERO)).is_ok());
        assert!(matches!(
            s.wait(Some(Duration::from_millis(5))),
            Err(N2dError::Timeout)
        ));
    }

    #[test]
    fn manual_reset_signal_stays_set() {
        let s = Signal::new(true);
        s.signal(true);
        assert!(s.wait(Some(Duration::ZERO)).is_ok());
        assert!(s.wait(Some(Duration::ZERO)).is_ok());
        s.signal(false);
        assert!(matches!(s.wait(Some(Duration::ZERO)), Err(N2dError::Timeout)));
    }

    #[test]
    fn interrupt_is_distinct_from_timeout() {
        let s = Arc::new(Signal::new(false));
        let waiter = {
            let s = s.clone();
            thread::spawn(move || s.wait(Some(Duration::from_secs(10))))
        };
        wait_for_waiters(&s, 1);
        s.interrupt();
        assert!(matches!(waiter.join().unwrap(), Err(N2dError::Interrupted)));
    }

    #[test]
    fn interrupt_aborts_every_waiter() {
        let s = Arc::new(Signal::new(false));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let s = s.clone();
                thread::spawn(move || s.wait(None))
            })
            .collect();
        wait_for_waiters(&s, 3);
        s.interrupt();
        for w in waiters {
            assert!(matches!(w.join().unwrap(), Err(N2dError::Interrupted)));
        }

        // Later waits are unaffected.
        s.signal(true);
        assert!(s.wait(Some(Duration::ZERO)).is_ok());
    }

    #[test]
    fn closed_signal_fails_later_waits() {
        let s = Signal::new(true);
        s.close();
        assert!(matches!(s.wait(None), Err(N2dError::Interrupted)));
        s.signal(true);
        assert!(matches!(
            s.wait(Some(Duration::ZERO)),
            Err(N2dError::Interrupted)
        ));
    }

    #[test]
    fn signal_wakes_a_blocked_waiter() {
        let s = Arc::new(Signal::new(false));
        let waiter = {
            let s = s.clone();
            thread::spawn(move || s.wait(None))
        };
        thread::sleep(Duration::from_millis(10));
        s.signal(true);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn bounded_acquire_times_out() {
        let m = Mutex::new(0);
        let _held = m.lock();
        assert!(matches!(
            acquire(&m, Some(Duration::from_millis(2))),
            Err(N2dError::Timeout)
        ));
    }
}
