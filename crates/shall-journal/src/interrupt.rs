//! Cooperative interruption of blocking journal calls.
//!
//! Every suspension point in the engine is cancellable: the caller hands a
//! shared flag to the blocking call and raises it from a signal handler or
//! another thread. Waiters re-check their predicate on every wakeup and
//! return `Interrupted` once the flag is up, with no state mutation beyond
//! what was already committed.

use parking_lot::{Condvar, MutexGuard};
use shall_error::{Result, ShallError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long a waiter sleeps between predicate re-checks. Wakeups are
/// edge-triggered by `notify_all`; the slice only bounds the latency of an
/// interrupt raised while nobody notifies.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Shared interrupt flag for blocking calls.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag; all current and future waits fail with `Interrupted`.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Fail with `Interrupted` if the flag is raised.
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            return Err(ShallError::Interrupted);
        }
        Ok(())
    }
}

/// Block on `cond` until `done` holds, honouring `intr`.
///
/// The guard's mutex is released while sleeping and held when `done` is
/// evaluated, so predicates may inspect the guarded state.
pub(crate) fn wait_interruptible<T, F>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    intr: &Interrupt,
    mut done: F,
) -> Result<()>
where
    F: FnMut(&mut T) -> bool,
{
    loop {
        if done(&mut *guard) {
            return Ok(());
        }
        intr.check()?;
        let _ = cond.wait_for(guard, WAIT_SLICE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn raised_interrupt_fails_the_wait() {
        let intr = Interrupt::new();
        intr.raise();
        let mutex = Mutex::new(());
        let cond = Condvar::new();
        let mut guard = mutex.lock();
        let result = wait_interruptible(&cond, &mut guard, &intr, |_| false);
        assert!(matches!(result, Err(ShallError::Interrupted)));
    }

    #[test]
    fn satisfied_predicate_wins_over_interrupt() {
        let intr = Interrupt::new();
        intr.raise();
        let mutex = Mutex::new(());
        let cond = Condvar::new();
        let mut guard = mutex.lock();
        assert!(wait_interruptible(&cond, &mut guard, &intr, |_| true).is_ok());
    }

    #[test]
    fn waiter_sees_state_change_from_another_thread() {
        let intr = Interrupt::new();
        let shared = Arc::new((Mutex::new(false), Condvar::new()));
        let other = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            *other.0.lock() = true;
            other.1.notify_all();
        });
        let mut guard = shared.0.lock();
        wait_interruptible(&shared.1, &mut guard, &intr, |ready| *ready).expect("wait");
        drop(guard);
        handle.join().expect("no panic");
    }
}
