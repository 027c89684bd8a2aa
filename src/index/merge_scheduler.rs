//! Merge scheduling.
//!
//! Which segments to merge is decided elsewhere; a [`MergeSource`] hands out
//! the merges it has registered and a [`MergeScheduler`] decides on which
//! thread and in what order they run.

use std::fmt;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::Result;
use crate::index::config::MergeSchedulerKind;

/// Why a scheduler is asked to run merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTrigger {
    SegmentFlush,
    FullFlush,
    Explicit,
    MergeFinished,
    Closing,
}

/// One registered merge: the source segments and the segment they become.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneMerge {
    pub segments: Vec<String>,
    pub target: String,
}

/// Something that has merges to run.
pub trait MergeSource: Send + Sync {
    /// Take the next registered merge, if any.
    fn next_merge(&self) -> Option<OneMerge>;

    fn has_pending_merges(&self) -> bool;

    /// Run a merge taken from [`next_merge`](Self::next_merge).
    fn merge(&self, merge: OneMerge) -> Result<()>;
}

pub trait MergeScheduler: Send + Sync + fmt::Debug {
    /// Run (or schedule) the pending merges of `source`.
    fn merge(&self, source: &dyn MergeSource, trigger: MergeTrigger) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Never runs a merge. Registered merges stay pending.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoMergeScheduler;

impl MergeScheduler for NoMergeScheduler {
    fn merge(&self, _source: &dyn MergeSource, _trigger: MergeTrigger) -> Result<()> {
        Ok(())
    }
}

/// Runs merges one at a time on the calling thread. Concurrent callers
/// queue up behind each other.
#[derive(Debug, Default)]
pub struct SerialMergeScheduler {
    running: Mutex<()>,
}

impl SerialMergeScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MergeScheduler for SerialMergeScheduler {
    fn merge(&self, source: &dyn MergeSource, trigger: MergeTrigger) -> Result<()> {
        let _running = self.running.lock();
        while let Some(merge) = source.next_merge() {
            debug!("running merge of {:?} into {} ({trigger:?})", merge.segments, merge.target);
            if let Err(e) = source.merge(merge) {
                warn!("merge failed: {e}");
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Build the scheduler a configuration names.
pub fn create_merge_scheduler(kind: MergeSchedulerKind) -> Box<dyn MergeScheduler> {
    match kind {
        MergeSchedulerKind::None => Box::new(NoMergeScheduler),
        MergeSchedulerKind::Serial => Box::new(SerialMergeScheduler::new()),
    }
}
