//! Reader identity and the non-owning parent registry.
//!
//! Every reader gets a process-unique [`ReaderId`]. A composite wrapping a
//! reader registers its id with the child's [`ReaderCore`]; the child never
//! holds a reference to the parent itself. The registry is consulted only
//! when a reader closes, to tell listeners which parents are now stale.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{IrisError, Result};

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a reader instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(u64);

impl ReaderId {
    pub fn next() -> Self {
        ReaderId(NEXT_READER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reader#{}", self.0)
    }
}

/// Called once when a reader closes, with the reader's id and the parents that
/// were registered at that moment.
pub type ClosedListener = Box<dyn Fn(ReaderId, &[ReaderId]) + Send + Sync>;

/// Identity, open state and parent bookkeeping shared by all reader kinds.
pub struct ReaderCore {
    id: ReaderId,
    closed: AtomicBool,
    parents: Mutex<Vec<ReaderId>>,
    listeners: Mutex<Vec<ClosedListener>>,
}

impl fmt::Debug for ReaderCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderCore")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("parents", &*self.parents.lock())
            .finish()
    }
}

impl Default for ReaderCore {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderCore {
    pub fn new() -> Self {
        ReaderCore {
            id: ReaderId::next(),
            closed: AtomicBool::new(false),
            parents: Mutex::new(Vec::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    /// Record that `parent` wraps this reader. Registering twice is a no-op.
    pub fn register_parent(&self, parent: ReaderId) {
        let mut parents = self.parents.lock();
        if !parents.contains(&parent) {
            parents.push(parent);
        }
    }

    pub fn parents(&self) -> Vec<ReaderId> {
        self.parents.lock().clone()
    }

    pub fn add_closed_listener(&self, listener: ClosedListener) {
        self.listeners.lock().push(listener);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(IrisError::already_closed(format!("{} is closed", self.id)));
        }
        Ok(())
    }

    /// Mark the reader closed and notify listeners. Returns `false` if it was
    /// already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let parents = self.parents();
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener(self.id, &parents);
        }
        true
    }
}
