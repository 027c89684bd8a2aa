//! Backpressure for indexing threads.
//!
//! [`StallControl`] blocks indexing threads while flushing lags too far
//! behind ingestion. The flush coordinator decides when the index is stalled
//! and pushes that decision through [`StallControl::update_stalled`]; indexing
//! threads call [`StallControl::wait_if_stalled`] at safe points.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct Waiters {
    num_waiting: usize,
    threads: HashSet<ThreadId>,
}

/// Two-state (healthy / stalled) monitor.
///
/// `stalled` is read without the lock on the fast path; every transition and
/// every wait happens under the lock.
#[derive(Debug, Default)]
pub struct StallControl {
    waiters: Mutex<Waiters>,
    cond: Condvar,
    stalled: AtomicBool,
    was_stalled: AtomicBool,
}

impl StallControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the stalled flag and wake every waiting thread.
    ///
    /// Waiters are woken on every call, including `update_stalled(true)`, so a
    /// waiter never sleeps through a transition it did not observe.
    pub fn update_stalled(&self, stalled: bool) {
        let _waiters = self.waiters.lock();
        let previous = self.stalled.swap(stalled, Ordering::AcqRel);
        if stalled {
            self.was_stalled.store(true, Ordering::Release);
            if !previous {
                warn!("indexing stalled: flushing is behind ingestion");
            }
        } else if previous {
            debug!("indexing healthy again");
        }
        self.cond.notify_all();
    }

    /// Block for one wake-up cycle if the index is stalled.
    ///
    /// Returns after a single wake-up even if the index is still stalled; the
    /// caller re-checks its own conditions and calls again.
    pub fn wait_if_stalled(&self) {
        if !self.stalled.load(Ordering::Acquire) {
            return;
        }
        let mut waiters = self.waiters.lock();
        if !self.stalled.load(Ordering::Acquire) {
            return;
        }
        let current = thread::current().id();
        waiters.num_waiting += 1;
        waiters.threads.insert(current);
        self.cond.wait(&mut waiters);
        waiters.threads.remove(&current);
        waiters.num_waiting -= 1;
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stalled.load(Ordering::Acquire)
    }

    pub fn is_healthy(&self) -> bool {
        !self.stalled.load(Ordering::Acquire)
    }

    /// True once the index has been stalled at least once. Never reset.
    pub fn was_stalled(&self) -> bool {
        self.was_stalled.load(Ordering::Acquire)
    }

    /// Whether any thread is currently blocked in [`wait_if_stalled`](Self::wait_if_stalled).
    pub fn has_blocked(&self) -> bool {
        self.waiters.lock().num_waiting > 0
    }

    pub fn num_waiting(&self) -> usize {
        self.waiters.lock().num_waiting
    }

    pub fn is_thread_queued(&self, thread: ThreadId) -> bool {
        self.waiters.lock().threads.contains(&thread)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_healthy_does_not_block() {
        let control = StallControl::new();
        control.wait_if_stalled();
        assert!(control.is_healthy());
        assert!(!control.was_stalled());
        assert!(!control.has_blocked());
    }

    #[test]
    fn test_blocked_thread_released_by_update() {
        let control = Arc::new(StallControl::new());
        control.update_stalled(true);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let control = control.clone();
            thread::spawn(move || {
                tx.send(thread::current().id()).unwrap();
                control.wait_if_stalled();
            })
        };
        let id = rx.recv().unwrap();
        assert!(wait_until(|| control.is_thread_queued(id)));
        assert_eq!(control.num_waiting(), 1);

        control.update_stalled(false);
        waiter.join().unwrap();
        assert!(!control.has_blocked());
        assert!(control.is_healthy());
        assert!(control.was_stalled());
    }

    #[test]
    fn test_single_wake_up_per_wait() {
        let control = Arc::new(StallControl::new());
        control.update_stalled(true);

        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_if_stalled())
        };
        assert!(wait_until(|| control.has_blocked()));

        // still stalled, but the waiter returns after one wake-up
        control.update_stalled(true);
        waiter.join().unwrap();
        assert!(control.any_stalled_threads());
        assert!(!control.has_blocked());
    }
}
