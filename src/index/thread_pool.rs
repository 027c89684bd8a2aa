//! Pool of per-thread indexing states.
//!
//! Each [`ThreadState`] owns at most one buffered writer behind its own lock.
//! An indexing thread checks a state out with [`ThreadStatePool::get_and_lock`]
//! and holds that lock for the whole document. The flush coordinator reads
//! the lock-free mirrors (`bytes_used`, `num_docs`, `flush_pending`) of every
//! state and only ever `try_lock`s states it does not own.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::debug;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::error::{IrisError, Result};

/// What the pool and the flush coordinator need to know about a buffered
/// per-thread writer.
pub trait PerThreadBuffer: Send + 'static {
    fn num_docs(&self) -> usize;

    fn bytes_used(&self) -> u64;

    fn segment_name(&self) -> &str;
}

/// Owned lock on a thread state's writer slot.
pub type ThreadStateGuard<W> = ArcMutexGuard<RawMutex, Option<W>>;

pub struct ThreadState<W> {
    ord: usize,
    writer: Arc<Mutex<Option<W>>>,
    // committed under the flush control lock
    bytes_used: AtomicU64,
    num_docs: AtomicUsize,
    flush_pending: AtomicBool,
}

impl<W> fmt::Debug for ThreadState<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("ord", &self.ord)
            .field("bytes_used", &self.bytes_used())
            .field("num_docs", &self.num_docs())
            .field("flush_pending", &self.is_flush_pending())
            .finish()
    }
}

impl<W> ThreadState<W> {
    fn new(ord: usize) -> Self {
        ThreadState {
            ord,
            writer: Arc::new(Mutex::new(None)),
            bytes_used: AtomicU64::new(0),
            num_docs: AtomicUsize::new(0),
            flush_pending: AtomicBool::new(false),
        }
    }

    pub fn ord(&self) -> usize {
        self.ord
    }

    /// Bytes last committed to the flush coordinator.
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Acquire)
    }

    /// Documents buffered as of the last commit.
    pub fn num_docs(&self) -> usize {
        self.num_docs.load(Ordering::Acquire)
    }

    pub fn is_flush_pending(&self) -> bool {
        self.flush_pending.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> ThreadStateGuard<W> {
        self.writer.lock_arc()
    }

    pub fn try_lock(&self) -> Option<ThreadStateGuard<W>> {
        self.writer.try_lock_arc()
    }

    pub(crate) fn set_bytes_used(&self, bytes: u64) {
        self.bytes_used.store(bytes, Ordering::Release);
    }

    pub(crate) fn set_num_docs(&self, docs: usize) {
        self.num_docs.store(docs, Ordering::Release);
    }

    pub(crate) fn set_flush_pending(&self, pending: bool) {
        self.flush_pending.store(pending, Ordering::Release);
    }
}

/// A thread state together with the lock on its writer slot.
pub struct LockedThreadState<W> {
    state: Arc<ThreadState<W>>,
    guard: ThreadStateGuard<W>,
}

impl<W> LockedThreadState<W> {
    pub fn state(&self) -> &Arc<ThreadState<W>> {
        &self.state
    }

    pub fn writer(&self) -> Option<&W> {
        self.guard.as_ref()
    }

    pub fn writer_mut(&mut self) -> Option<&mut W> {
        self.guard.as_mut()
    }

    /// Install a writer into an empty slot.
    pub fn install(&mut self, writer: W) -> &mut W {
        self.guard.insert(writer)
    }

    pub fn guard_mut(&mut self) -> &mut ThreadStateGuard<W> {
        &mut self.guard
    }

    pub fn into_parts(self) -> (Arc<ThreadState<W>>, ThreadStateGuard<W>) {
        (self.state, self.guard)
    }
}

struct PoolState<W> {
    states: Vec<Arc<ThreadState<W>>>,
    next_contended: usize,
    closed: bool,
}

/// Fixed-capacity pool of [`ThreadState`]s, activated lazily.
pub struct ThreadStatePool<W> {
    max_thread_states: usize,
    inner: Mutex<PoolState<W>>,
}

impl<W> fmt::Debug for ThreadStatePool<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStatePool")
            .field("max_thread_states", &self.max_thread_states)
            .field("active", &self.active_thread_state_count())
            .finish()
    }
}

impl<W> ThreadStatePool<W> {
    pub fn new(max_thread_states: usize) -> Self {
        ThreadStatePool {
            max_thread_states: max_thread_states.max(1),
            inner: Mutex::new(PoolState {
                states: Vec::new(),
                next_contended: 0,
                closed: false,
            }),
        }
    }

    pub fn max_thread_states(&self) -> usize {
        self.max_thread_states
    }

    /// Check out a thread state for the calling thread.
    ///
    /// Prefers an unlocked state that is not flush pending, then any unlocked
    /// state, then activates a new one while capacity allows. When every
    /// state is busy it blocks on one of them, round robin.
    pub fn get_and_lock(&self) -> Result<LockedThreadState<W>> {
        let contended = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(IrisError::already_closed("thread state pool is closed"));
            }
            let preferred = inner
                .states
                .iter()
                .filter(|s| !s.is_flush_pending())
                .chain(inner.states.iter().filter(|s| s.is_flush_pending()));
            for state in preferred {
                if let Some(guard) = state.try_lock() {
                    return Ok(LockedThreadState {
                        state: state.clone(),
                        guard,
                    });
                }
            }
            if inner.states.len() < self.max_thread_states {
                let state = Arc::new(ThreadState::new(inner.states.len()));
                let guard = state.lock();
                inner.states.push(state.clone());
                debug!("activated thread state {}", state.ord());
                return Ok(LockedThreadState { state, guard });
            }
            let index = inner.next_contended % inner.states.len();
            inner.next_contended = inner.next_contended.wrapping_add(1);
            inner.states[index].clone()
        };
        let guard = contended.lock();
        Ok(LockedThreadState {
            state: contended,
            guard,
        })
    }

    pub fn active_thread_state_count(&self) -> usize {
        self.inner.lock().states.len()
    }

    /// Snapshot of every active thread state.
    pub fn active_thread_states(&self) -> Vec<Arc<ThreadState<W>>> {
        self.inner.lock().states.clone()
    }

    pub fn get_thread_state(&self, ord: usize) -> Option<Arc<ThreadState<W>>> {
        self.inner.lock().states.get(ord).cloned()
    }

    /// Take the writer out of a locked state and clear its accounting.
    pub fn reset(&self, state: &ThreadState<W>, guard: &mut ThreadStateGuard<W>) -> Option<W> {
        state.set_bytes_used(0);
        state.set_num_docs(0);
        state.set_flush_pending(false);
        guard.take()
    }

    /// Stop handing out thread states and take every buffered writer out.
    pub fn deactivate_unreleased(&self) -> Vec<W> {
        let states = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.states.clone()
        };
        states
            .iter()
            .filter_map(|state| {
                let mut guard = state.lock();
                self.reset(state, &mut guard)
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
