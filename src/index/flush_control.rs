//! Flush coordination across thread states.
//!
//! [`FlushControl`] tracks the RAM held by every thread state, runs the
//! configured [`FlushPolicy`] after each document, checks pending writers out
//! for flushing, runs full flushes and decides when indexing must stall.
//!
//! Lock order: a thread state lock is taken before the flush control lock,
//! and the flush control lock before the pool lock. While holding the flush
//! control lock, thread states are only ever `try_lock`ed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::index::config::IndexWriterConfig;
use crate::index::flush_policy::{FlushDecisions, FlushPolicy, ThreadStateStats};
use crate::index::stall::StallControl;
use crate::index::thread_pool::{
    LockedThreadState, PerThreadBuffer, ThreadState, ThreadStateGuard, ThreadStatePool,
};
use crate::index::updates::BufferedUpdatesStream;

struct BlockedFlush<W> {
    writer: W,
    bytes: u64,
}

/// RAM usage snapshot, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub active_bytes: u64,
    pub flush_bytes: u64,
    pub num_pending: usize,
    pub num_flushing: usize,
    pub num_queued: usize,
    pub num_blocked: usize,
    pub peak_active_bytes: u64,
    pub peak_flush_bytes: u64,
    pub peak_net_bytes: u64,
    pub peak_delta: u64,
}

struct FlushState<W> {
    active_bytes: u64,
    flush_bytes: u64,
    num_pending: usize,
    flush_queue: VecDeque<W>,
    blocked_flushes: Vec<BlockedFlush<W>>,
    // segment name -> bytes, for every checked out writer
    flushing_writers: AHashMap<String, u64>,
    full_flush_buffer: Vec<W>,
    peak_active_bytes: u64,
    peak_flush_bytes: u64,
    peak_net_bytes: u64,
    peak_delta: u64,
    closed: bool,
}

impl<W> FlushState<W> {
    fn new() -> Self {
        FlushState {
            active_bytes: 0,
            flush_bytes: 0,
            num_pending: 0,
            flush_queue: VecDeque::new(),
            blocked_flushes: Vec::new(),
            flushing_writers: AHashMap::new(),
            full_flush_buffer: Vec::new(),
            peak_active_bytes: 0,
            peak_flush_bytes: 0,
            peak_net_bytes: 0,
            peak_delta: 0,
            closed: false,
        }
    }

    fn set_flush_pending(&mut self, state: &ThreadState<W>) {
        if state.num_docs() == 0 || state.is_flush_pending() {
            return;
        }
        state.set_flush_pending(true);
        let bytes = state.bytes_used();
        self.flush_bytes += bytes;
        self.active_bytes = self.active_bytes.saturating_sub(bytes);
        self.num_pending += 1;
    }

    fn update_peaks(&mut self, delta: u64) {
        self.peak_active_bytes = self.peak_active_bytes.max(self.active_bytes);
        self.peak_flush_bytes = self.peak_flush_bytes.max(self.flush_bytes);
        self.peak_net_bytes = self
            .peak_net_bytes
            .max(self.active_bytes + self.flush_bytes);
        self.peak_delta = self.peak_delta.max(delta);
    }
}

fn apply_delta(value: &mut u64, delta: i64) {
    if delta >= 0 {
        *value += delta as u64;
    } else {
        *value = value.saturating_sub(delta.unsigned_abs());
    }
}

fn stats_of<W>(state: &ThreadState<W>) -> ThreadStateStats {
    ThreadStateStats {
        ord: state.ord(),
        bytes_used: state.bytes_used(),
        num_docs: state.num_docs(),
        flush_pending: state.is_flush_pending(),
    }
}

/// The coordinator as a policy sees it.
struct Decisions<'a, W> {
    control: &'a FlushControl<W>,
    inner: &'a mut FlushState<W>,
}

impl<W: PerThreadBuffer> FlushDecisions for Decisions<'_, W> {
    fn active_bytes(&self) -> u64 {
        self.inner.active_bytes
    }

    fn delete_bytes_used(&self) -> u64 {
        self.control.delete_bytes_used()
    }

    fn num_global_term_deletes(&self) -> usize {
        self.control.updates.num_terms()
    }

    fn thread_states(&self) -> Vec<ThreadStateStats> {
        self.control
            .pool
            .active_thread_states()
            .iter()
            .map(|s| stats_of(s))
            .collect()
    }

    fn set_flush_pending(&mut self, ord: usize) {
        if let Some(state) = self.control.pool.get_thread_state(ord) {
            self.inner.set_flush_pending(&state);
        }
    }

    fn set_apply_all_deletes(&mut self) {
        self.control.set_apply_all_deletes();
    }
}

/// Tracks per-thread RAM and decides which writers flush.
pub struct FlushControl<W> {
    inner: Mutex<FlushState<W>>,
    flushed: Condvar,
    pool: Arc<ThreadStatePool<W>>,
    policy: Box<dyn FlushPolicy>,
    stall: StallControl,
    updates: Arc<BufferedUpdatesStream>,
    hard_max_bytes_per_writer: u64,
    stall_limit_bytes: u64,
    full_flush: AtomicBool,
    apply_all_deletes: AtomicBool,
}

impl<W: PerThreadBuffer> FlushControl<W> {
    pub fn new(
        config: &IndexWriterConfig,
        pool: Arc<ThreadStatePool<W>>,
        updates: Arc<BufferedUpdatesStream>,
        policy: Box<dyn FlushPolicy>,
    ) -> Self {
        FlushControl {
            inner: Mutex::new(FlushState::new()),
            flushed: Condvar::new(),
            pool,
            policy,
            stall: StallControl::new(),
            updates,
            hard_max_bytes_per_writer: config.per_thread_hard_limit_bytes(),
            stall_limit_bytes: config
                .ram_buffer_bytes()
                .map_or(u64::MAX, |bytes| bytes.saturating_mul(2)),
            full_flush: AtomicBool::new(false),
            apply_all_deletes: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<ThreadStatePool<W>> {
        &self.pool
    }

    pub fn stall_control(&self) -> &StallControl {
        &self.stall
    }

    pub fn delete_bytes_used(&self) -> u64 {
        self.updates.bytes_used() as u64
    }

    /// Account for the document just added to `locked`, run the policy and
    /// return a writer the calling thread must flush, if any.
    pub fn do_after_document(&self, locked: &mut LockedThreadState<W>, is_update: bool) -> Option<W> {
        let state = locked.state().clone();
        let mut inner = self.inner.lock();
        self.commit_per_thread_bytes(&mut inner, &state, locked.writer());

        if !state.is_flush_pending() {
            let stats = stats_of(&state);
            let mut decisions = Decisions {
                control: self,
                inner: &mut inner,
            };
            if is_update {
                self.policy.on_update(&mut decisions, &stats);
            } else {
                self.policy.on_insert(&mut decisions, &stats);
            }
            if !state.is_flush_pending() && state.bytes_used() > self.hard_max_bytes_per_writer {
                warn!(
                    "thread state {} exceeds the per-thread hard limit with {} bytes",
                    state.ord(),
                    state.bytes_used()
                );
                inner.set_flush_pending(&state);
            }
        }

        let flushing = if self.is_full_flush() {
            if state.is_flush_pending() {
                self.checkout_and_block(&mut inner, &state, locked.guard_mut());
                inner.flush_queue.pop_front()
            } else {
                None
            }
        } else if state.is_flush_pending() {
            self.checkout(&mut inner, &state, locked.guard_mut())
        } else {
            None
        };
        self.update_stall_state(&inner);
        flushing
    }

    /// Run the policy after a delete that is not part of an update.
    pub fn do_on_delete(&self) {
        let mut inner = self.inner.lock();
        let mut decisions = Decisions {
            control: self,
            inner: &mut inner,
        };
        self.policy.on_delete(&mut decisions, None);
    }

    /// Remove an aborted thread state's RAM from the books and take its
    /// writer out of the pool.
    pub fn do_on_abort(&self, locked: &mut LockedThreadState<W>) -> Option<W> {
        let state = locked.state().clone();
        let mut inner = self.inner.lock();
        let bytes = state.bytes_used();
        if state.is_flush_pending() {
            inner.flush_bytes = inner.flush_bytes.saturating_sub(bytes);
            inner.num_pending = inner.num_pending.saturating_sub(1);
        } else {
            inner.active_bytes = inner.active_bytes.saturating_sub(bytes);
        }
        let writer = self.pool.reset(&state, locked.guard_mut());
        self.update_stall_state(&inner);
        writer
    }

    fn commit_per_thread_bytes(&self, inner: &mut FlushState<W>, state: &ThreadState<W>, writer: Option<&W>) {
        let (bytes, docs) = writer.map_or((0, 0), |w| (w.bytes_used(), w.num_docs()));
        let delta = bytes as i64 - state.bytes_used() as i64;
        state.set_bytes_used(bytes);
        state.set_num_docs(docs);
        // a state set pending during a delete already moved its bytes
        if state.is_flush_pending() {
            apply_delta(&mut inner.flush_bytes, delta);
        } else {
            apply_delta(&mut inner.active_bytes, delta);
        }
        inner.update_peaks(delta.max(0) as u64);
    }

    /// Take the writer of a pending state out of the pool and register it as
    /// flushing.
    fn checkout(
        &self,
        inner: &mut FlushState<W>,
        state: &ThreadState<W>,
        guard: &mut ThreadStateGuard<W>,
    ) -> Option<W> {
        debug_assert!(state.is_flush_pending());
        let bytes = state.bytes_used();
        let writer = self.pool.reset(state, guard);
        inner.num_pending = inner.num_pending.saturating_sub(1);
        match writer {
            Some(writer) => {
                debug_assert!(!inner.flushing_writers.contains_key(writer.segment_name()));
                inner
                    .flushing_writers
                    .insert(writer.segment_name().to_string(), bytes);
                Some(writer)
            }
            None => {
                inner.flush_bytes = inner.flush_bytes.saturating_sub(bytes);
                None
            }
        }
    }

    /// Park a writer that became pending during a full flush until the full
    /// flush is done.
    fn checkout_and_block(
        &self,
        inner: &mut FlushState<W>,
        state: &ThreadState<W>,
        guard: &mut ThreadStateGuard<W>,
    ) {
        debug_assert!(self.is_full_flush());
        let bytes = state.bytes_used();
        if let Some(writer) = self.pool.reset(state, guard) {
            inner.num_pending = inner.num_pending.saturating_sub(1);
            debug!("blocked flush of {} until the full flush finishes", writer.segment_name());
            inner.blocked_flushes.push(BlockedFlush { writer, bytes });
        }
    }

    fn update_stall_state(&self, inner: &FlushState<W>) -> bool {
        let limit = self.stall_limit_bytes;
        // only stall if finishing the ongoing flushes can release the stall
        let stall = inner.active_bytes.saturating_add(inner.flush_bytes) > limit
            && inner.active_bytes < limit
            && !inner.closed;
        self.stall.update_stalled(stall);
        stall
    }

    /// The next writer to flush: queued flushes first, then pending states
    /// that can be locked without blocking.
    pub fn next_pending_flush(&self) -> Option<W> {
        let mut inner = self.inner.lock();
        let next = self.next_pending_flush_locked(&mut inner);
        self.update_stall_state(&inner);
        next
    }

    fn next_pending_flush_locked(&self, inner: &mut FlushState<W>) -> Option<W> {
        if let Some(writer) = inner.flush_queue.pop_front() {
            return Some(writer);
        }
        if inner.num_pending == 0 || self.is_full_flush() {
            return None;
        }
        for state in self.pool.active_thread_states() {
            if !state.is_flush_pending() {
                continue;
            }
            if let Some(mut guard) = state.try_lock() {
                if let Some(writer) = self.checkout(inner, &state, &mut guard) {
                    return Some(writer);
                }
            }
        }
        None
    }

    /// Release the bytes of a writer whose flush finished, successfully or not.
    pub fn after_flush(&self, segment: &str) {
        let mut inner = self.inner.lock();
        match inner.flushing_writers.remove(segment) {
            Some(bytes) => inner.flush_bytes = inner.flush_bytes.saturating_sub(bytes),
            None => warn!("after_flush for {segment}, which was not flushing"),
        }
        self.update_stall_state(&inner);
        self.flushed.notify_all();
    }

    /// Block until no writer is flushing.
    pub fn wait_for_flush(&self) {
        let mut inner = self.inner.lock();
        while !inner.flushing_writers.is_empty() {
            self.flushed.wait(&mut inner);
        }
    }

    pub fn is_full_flush(&self) -> bool {
        self.full_flush.load(Ordering::Acquire)
    }

    /// Start a full flush: every writer buffered now is checked out and
    /// queued. Writers created afterwards keep indexing; if they become
    /// pending before [`finish_full_flush`](Self::finish_full_flush) they are
    /// parked.
    pub fn mark_for_full_flush(&self) {
        {
            let _inner = self.inner.lock();
            let was_full = self.full_flush.swap(true, Ordering::AcqRel);
            debug_assert!(!was_full, "nested full flush");
        }
        for state in self.pool.active_thread_states() {
            let mut guard = state.lock();
            let docs = guard.as_ref().map_or(0, |w| w.num_docs());
            if docs == 0 {
                // drops an empty writer
                self.pool.reset(&state, &mut guard);
                continue;
            }
            let mut inner = self.inner.lock();
            self.commit_per_thread_bytes(&mut inner, &state, guard.as_ref());
            inner.set_flush_pending(&state);
            if let Some(writer) = self.checkout(&mut inner, &state, &mut guard) {
                inner.full_flush_buffer.push(writer);
            }
        }
        let mut inner = self.inner.lock();
        self.release_blocked_flushes(&mut inner);
        let buffered = std::mem::take(&mut inner.full_flush_buffer);
        inner.flush_queue.extend(buffered);
        info!("full flush queued {} writers", inner.flush_queue.len());
        self.update_stall_state(&inner);
    }

    fn release_blocked_flushes(&self, inner: &mut FlushState<W>) {
        for blocked in std::mem::take(&mut inner.blocked_flushes) {
            inner
                .flushing_writers
                .insert(blocked.writer.segment_name().to_string(), blocked.bytes);
            // pending count was already decremented when the writer was parked
            inner.flush_queue.push_back(blocked.writer);
        }
    }

    pub fn finish_full_flush(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(self.is_full_flush());
        self.release_blocked_flushes(&mut inner);
        self.full_flush.store(false, Ordering::Release);
        self.update_stall_state(&inner);
    }

    /// Drop every queued and parked writer, returning them so the caller can
    /// abort them.
    pub fn abort_pending_flushes(&self) -> Vec<W> {
        let mut inner = self.inner.lock();
        let mut aborted = Vec::new();
        for writer in std::mem::take(&mut inner.flush_queue) {
            if let Some(bytes) = inner.flushing_writers.remove(writer.segment_name()) {
                inner.flush_bytes = inner.flush_bytes.saturating_sub(bytes);
            }
            aborted.push(writer);
        }
        for blocked in std::mem::take(&mut inner.blocked_flushes) {
            inner.flush_bytes = inner.flush_bytes.saturating_sub(blocked.bytes);
            aborted.push(blocked.writer);
        }
        for writer in std::mem::take(&mut inner.full_flush_buffer) {
            if let Some(bytes) = inner.flushing_writers.remove(writer.segment_name()) {
                inner.flush_bytes = inner.flush_bytes.saturating_sub(bytes);
            }
            aborted.push(writer);
        }
        self.update_stall_state(&inner);
        self.flushed.notify_all();
        aborted
    }

    pub fn abort_full_flush(&self) -> Vec<W> {
        let aborted = self.abort_pending_flushes();
        self.full_flush.store(false, Ordering::Release);
        aborted
    }

    pub fn set_apply_all_deletes(&self) {
        self.apply_all_deletes.store(true, Ordering::Release);
    }

    pub fn get_and_reset_apply_all_deletes(&self) -> bool {
        self.apply_all_deletes.swap(false, Ordering::AcqRel)
    }

    pub fn wait_if_stalled(&self) {
        self.stall.wait_if_stalled();
    }

    pub fn any_stalled_threads(&self) -> bool {
        self.stall.any_stalled_threads()
    }

    pub fn num_queued_flushes(&self) -> usize {
        self.inner.lock().flush_queue.len()
    }

    pub fn num_pending(&self) -> usize {
        self.inner.lock().num_pending
    }

    pub fn active_bytes(&self) -> u64 {
        self.inner.lock().active_bytes
    }

    pub fn flush_bytes(&self) -> u64 {
        self.inner.lock().flush_bytes
    }

    pub fn net_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        inner.active_bytes + inner.flush_bytes
    }

    pub fn stats(&self) -> FlushStats {
        let inner = self.inner.lock();
        FlushStats {
            active_bytes: inner.active_bytes,
            flush_bytes: inner.flush_bytes,
            num_pending: inner.num_pending,
            num_flushing: inner.flushing_writers.len(),
            num_queued: inner.flush_queue.len(),
            num_blocked: inner.blocked_flushes.len(),
            peak_active_bytes: inner.peak_active_bytes,
            peak_flush_bytes: inner.peak_flush_bytes,
            peak_net_bytes: inner.peak_net_bytes,
            peak_delta: inner.peak_delta,
        }
    }

    /// Stop stalling for good; set once the writer closes.
    pub fn set_closed(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.update_stall_state(&inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::flush_policy::FlushByRamOrCountsPolicy;
    use crate::index::thread_pool::tests::FakeBuffer;

    const MB: u64 = 1024 * 1024;

    fn control(config: IndexWriterConfig, states: usize) -> FlushControl<FakeBuffer> {
        let pool = Arc::new(ThreadStatePool::new(states));
        let policy = Box::new(FlushByRamOrCountsPolicy::new(&config));
        FlushControl::new(&config, pool, Arc::new(BufferedUpdatesStream::new()), policy)
    }

    /// Add one document of `bytes` to the locked state.
    fn add_doc(
        control: &FlushControl<FakeBuffer>,
        locked: &mut LockedThreadState<FakeBuffer>,
        bytes: u64,
    ) -> Option<FakeBuffer> {
        if locked.writer().is_none() {
            let name = format!("_{}", locked.state().ord());
            locked.install(FakeBuffer::new(&name));
        }
        let writer = locked.writer_mut().unwrap();
        writer.docs += 1;
        writer.bytes += bytes;
        control.do_after_document(locked, false)
    }

    #[test]
    fn test_doc_count_checks_out_calling_writer() {
        let config = IndexWriterConfig::default()
            .with_ram_buffer_size_mb(None)
            .with_max_buffered_docs(Some(3));
        let control = control(config, 2);
        let mut locked = control.pool().get_and_lock().unwrap();
        assert!(add_doc(&control, &mut locked, 10).is_none());
        assert!(add_doc(&control, &mut locked, 10).is_none());
        let flushing = add_doc(&control, &mut locked, 10).unwrap();
        assert_eq!(flushing.docs, 3);
        assert!(locked.writer().is_none());

        let stats = control.stats();
        assert_eq!(stats.active_bytes, 0);
        assert_eq!(stats.flush_bytes, 30);
        assert_eq!(stats.num_flushing, 1);
        assert_eq!(stats.num_pending, 0);

        control.after_flush(&flushing.name);
        assert_eq!(control.flush_bytes(), 0);
        control.wait_for_flush();
    }

    #[test]
    fn test_ram_limit_marks_largest_and_other_thread_checks_it_out() {
        let config = IndexWriterConfig::default().with_ram_buffer_size_mb(Some(1.0));
        let control = control(config, 2);
        let mut first = control.pool().get_and_lock().unwrap();
        let mut second = control.pool().get_and_lock().unwrap();

        assert!(add_doc(&control, &mut first, 600 * 1024).is_none());
        // second is smaller, so the first state is marked pending while
        // its lock is held elsewhere
        assert!(add_doc(&control, &mut second, 500 * 1024).is_none());
        assert!(first.state().is_flush_pending());
        assert_eq!(control.num_pending(), 1);
        assert!(control.next_pending_flush().is_none());

        drop(first);
        let flushing = control.next_pending_flush().unwrap();
        assert_eq!(flushing.name, "_0");
        assert_eq!(control.active_bytes(), 500 * 1024);
        assert_eq!(control.flush_bytes(), 600 * 1024);
    }

    #[test]
    fn test_stall_when_flushing_falls_behind() {
        let config = IndexWriterConfig::default().with_ram_buffer_size_mb(Some(1.0));
        let control = control(config, 2);
        let mut locked = control.pool().get_and_lock().unwrap();
        assert!(add_doc(&control, &mut locked, 10).is_none());
        assert!(!control.any_stalled_threads());

        // net bytes above twice the buffer, active bytes below it
        let mut other = control.pool().get_and_lock().unwrap();
        let flushing = add_doc(&control, &mut other, 3 * MB).unwrap();
        assert_eq!(control.active_bytes(), 10);
        assert!(control.any_stalled_threads());
        assert!(control.stall_control().was_stalled());

        control.after_flush(&flushing.name);
        assert!(!control.any_stalled_threads());
        assert!(control.stall_control().was_stalled());
    }

    #[test]
    fn test_closed_control_never_stalls() {
        let config = IndexWriterConfig::default().with_ram_buffer_size_mb(Some(1.0));
        let control = control(config, 1);
        control.set_closed();
        let mut locked = control.pool().get_and_lock().unwrap();
        let flushing = add_doc(&control, &mut locked, 3 * MB).unwrap();
        assert!(!control.any_stalled_threads());
        control.after_flush(&flushing.name);
    }

    #[test]
    fn test_full_flush_collects_every_writer() {
        let config = IndexWriterConfig::default();
        let control = control(config, 2);
        {
            let mut first = control.pool().get_and_lock().unwrap();
            let mut second = control.pool().get_and_lock().unwrap();
            add_doc(&control, &mut first, 100);
            add_doc(&control, &mut second, 200);
        }
        control.mark_for_full_flush();
        assert!(control.is_full_flush());
        assert_eq!(control.num_queued_flushes(), 2);
        assert_eq!(control.flush_bytes(), 300);
        assert_eq!(control.active_bytes(), 0);

        let mut names = Vec::new();
        while let Some(writer) = control.next_pending_flush() {
            names.push(writer.name.clone());
            control.after_flush(&writer.name);
        }
        names.sort();
        assert_eq!(names, vec!["_0".to_string(), "_1".to_string()]);
        control.finish_full_flush();
        assert!(!control.is_full_flush());
        assert_eq!(control.net_bytes(), 0);
    }

    #[test]
    fn test_pending_during_full_flush_is_parked() {
        let config = IndexWriterConfig::default()
            .with_ram_buffer_size_mb(None)
            .with_max_buffered_docs(Some(1));
        let control = control(config, 1);
        control.mark_for_full_flush();

        let mut locked = control.pool().get_and_lock().unwrap();
        assert!(add_doc(&control, &mut locked, 10).is_none());
        assert_eq!(control.stats().num_blocked, 1);
        drop(locked);

        control.finish_full_flush();
        let parked = control.next_pending_flush().unwrap();
        assert_eq!(parked.docs, 1);
        control.after_flush(&parked.name);
        assert_eq!(control.net_bytes(), 0);
    }

    #[test]
    fn test_abort_releases_bytes() {
        let config = IndexWriterConfig::default();
        let control = control(config, 1);
        let mut locked = control.pool().get_and_lock().unwrap();
        add_doc(&control, &mut locked, 1000);
        assert_eq!(control.active_bytes(), 1000);
        let writer = control.do_on_abort(&mut locked).unwrap();
        assert_eq!(writer.docs, 1);
        assert_eq!(control.active_bytes(), 0);
        assert!(locked.writer().is_none());
    }
}
