//! Overflow accounting.
//!
//! A dedicated lock protects the two overflow counters so producers can
//! update them without the engine mutex. Lock order is strict: the engine
//! mutex (when needed) is taken first, this lock second, never the
//! reverse. The paired condvar is the log queue: producers waiting for
//! ring space and commit barriers waiting out an in-flight commit both
//! sleep here.

use parking_lot::{Condvar, Mutex};

/// Counters accumulated between an OVERFLOW and its RECOVER marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverflowCounters {
    /// Records dropped (or held back) since space ran out.
    pub num_dropped: u64,
    /// Bytes that would have been required to avoid the overflow.
    pub extra_space: u64,
}

/// The log queue: overflow counters plus the wait queue for space.
#[derive(Debug, Default)]
pub(crate) struct LogQueue {
    pub lock: Mutex<OverflowCounters>,
    pub cond: Condvar,
}

impl LogQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one record that did not fit; returns the previous drop
    /// count so the first caller knows to emit the OVERFLOW marker.
    pub fn record_drop(&self, space: u64) -> u64 {
        let mut counters = self.lock.lock();
        let previous = counters.num_dropped;
        counters.num_dropped += 1;
        counters.extra_space += space;
        previous
    }

    /// Snapshot-and-zero the counters for a RECOVER marker; `None` when no
    /// overflow is pending.
    pub fn take(&self) -> Option<OverflowCounters> {
        let mut counters = self.lock.lock();
        if counters.num_dropped == 0 {
            return None;
        }
        Some(std::mem::take(&mut *counters))
    }

    /// Current counters, for the info surface.
    pub fn snapshot(&self) -> OverflowCounters {
        *self.lock.lock()
    }
}
