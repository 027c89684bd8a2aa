//! Flush policies decide which thread state must flush.
//!
//! A policy runs synchronously after every insert, update and delete while
//! the caller holds both the flush control lock and the lock of the calling
//! thread state, so it never takes locks of its own. It sees the coordinator
//! only through [`FlushDecisions`].

use std::fmt;

use log::debug;

use crate::index::config::IndexWriterConfig;

/// Accounting snapshot of one thread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStateStats {
    pub ord: usize,
    pub bytes_used: u64,
    pub num_docs: usize,
    pub flush_pending: bool,
}

/// The view of the flush coordinator a policy works against.
pub trait FlushDecisions {
    /// Bytes held by thread states that are not flush pending.
    fn active_bytes(&self) -> u64;

    /// Bytes held by buffered deletes and updates.
    fn delete_bytes_used(&self) -> u64;

    fn num_global_term_deletes(&self) -> usize;

    /// Every active thread state, in pool order.
    fn thread_states(&self) -> Vec<ThreadStateStats>;

    /// Mark a thread state flush pending. Ignored for states without
    /// buffered documents.
    fn set_flush_pending(&mut self, ord: usize);

    /// Ask for all buffered deletes to be applied to flushed segments.
    fn set_apply_all_deletes(&mut self);
}

pub trait FlushPolicy: Send + Sync + fmt::Debug {
    /// Called after a document was added to `state`.
    fn on_insert(&self, control: &mut dyn FlushDecisions, state: &ThreadStateStats);

    /// Called after a delete. `state` is `None` for deletes that are not
    /// part of a document update.
    fn on_delete(&self, control: &mut dyn FlushDecisions, state: Option<&ThreadStateStats>);

    fn on_update(&self, control: &mut dyn FlushDecisions, state: &ThreadStateStats) {
        self.on_insert(control, state);
        self.on_delete(control, Some(state));
    }
}

/// Flushes by buffered document count, by RAM, and applies deletes by
/// buffered delete term count.
///
/// * A thread state holding `max_buffered_docs` documents is marked pending.
/// * When active plus delete bytes reach the RAM buffer, the thread state
///   using the most RAM is marked pending. States are scanned in pool order
///   with a strict `>`, so on ties the earliest state wins.
/// * When buffered delete terms reach `max_buffered_delete_terms`, or delete
///   bytes alone exceed the RAM buffer, all deletes are applied.
#[derive(Debug, Clone)]
pub struct FlushByRamOrCountsPolicy {
    max_buffered_docs: Option<usize>,
    ram_buffer_bytes: Option<u64>,
    max_buffered_delete_terms: Option<usize>,
}

impl FlushByRamOrCountsPolicy {
    pub fn new(config: &IndexWriterConfig) -> Self {
        FlushByRamOrCountsPolicy {
            max_buffered_docs: config.max_buffered_docs,
            ram_buffer_bytes: config.ram_buffer_bytes(),
            max_buffered_delete_terms: config.max_buffered_delete_terms,
        }
    }

    fn find_largest_non_pending(
        &self,
        control: &dyn FlushDecisions,
        state: &ThreadStateStats,
    ) -> usize {
        let mut largest: Option<(usize, u64)> = None;
        for next in control.thread_states() {
            if next.flush_pending || next.num_docs == 0 || next.bytes_used == 0 {
                continue;
            }
            if largest.is_none_or(|(_, max_bytes)| next.bytes_used > max_bytes) {
                largest = Some((next.ord, next.bytes_used));
            }
        }
        largest.map_or(state.ord, |(ord, _)| ord)
    }
}

impl FlushPolicy for FlushByRamOrCountsPolicy {
    fn on_insert(&self, control: &mut dyn FlushDecisions, state: &ThreadStateStats) {
        if let Some(max_docs) = self.max_buffered_docs {
            if state.num_docs >= max_docs {
                control.set_flush_pending(state.ord);
                return;
            }
        }
        if let Some(limit) = self.ram_buffer_bytes {
            let total = control.active_bytes() + control.delete_bytes_used();
            if total >= limit {
                let largest = self.find_largest_non_pending(control, state);
                debug!(
                    "flush by RAM: {total} bytes used, limit {limit}; marking thread state {largest}"
                );
                control.set_flush_pending(largest);
            }
        }
    }

    fn on_delete(&self, control: &mut dyn FlushDecisions, _state: Option<&ThreadStateStats>) {
        if let Some(max_terms) = self.max_buffered_delete_terms {
            if control.num_global_term_deletes() >= max_terms {
                control.set_apply_all_deletes();
            }
        }
        if let Some(limit) = self.ram_buffer_bytes {
            if control.delete_bytes_used() > limit {
                debug!("delete bytes exceed the RAM buffer; applying all deletes");
                control.set_apply_all_deletes();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct FakeControl {
        states: Vec<ThreadStateStats>,
        delete_bytes: u64,
        delete_terms: usize,
        apply_all_deletes: bool,
    }

    impl FakeControl {
        fn with_states(bytes_and_docs: &[(u64, usize)]) -> Self {
            FakeControl {
                states: bytes_and_docs
                    .iter()
                    .enumerate()
                    .map(|(ord, &(bytes_used, num_docs))| ThreadStateStats {
                        ord,
                        bytes_used,
                        num_docs,
                        flush_pending: false,
                    })
                    .collect(),
                ..Default::default()
            }
        }

        fn pending(&self) -> Vec<usize> {
            self.states
                .iter()
                .filter(|s| s.flush_pending)
                .map(|s| s.ord)
                .collect()
        }
    }

    impl FlushDecisions for FakeControl {
        fn active_bytes(&self) -> u64 {
            self.states
                .iter()
                .filter(|s| !s.flush_pending)
                .map(|s| s.bytes_used)
                .sum()
        }

        fn delete_bytes_used(&self) -> u64 {
            self.delete_bytes
        }

        fn num_global_term_deletes(&self) -> usize {
            self.delete_terms
        }

        fn thread_states(&self) -> Vec<ThreadStateStats> {
            self.states.clone()
        }

        fn set_flush_pending(&mut self, ord: usize) {
            let state = &mut self.states[ord];
            if state.num_docs > 0 {
                state.flush_pending = true;
            }
        }

        fn set_apply_all_deletes(&mut self) {
            self.apply_all_deletes = true;
        }
    }

    fn policy(docs: Option<usize>, ram_mb: Option<f64>, terms: Option<usize>) -> FlushByRamOrCountsPolicy {
        FlushByRamOrCountsPolicy::new(
            &IndexWriterConfig::default()
                .with_max_buffered_docs(docs)
                .with_ram_buffer_size_mb(ram_mb)
                .with_max_buffered_delete_terms(terms),
        )
    }

    #[test]
    fn test_doc_count_marks_only_calling_state() {
        let policy = policy(Some(1000), None, None);
        let mut control = FakeControl::with_states(&[(0, 0), (10, 2000), (10, 5)]);

        for docs in 1..1000 {
            control.states[0].num_docs = docs;
            let state = control.states[0];
            policy.on_insert(&mut control, &state);
            assert!(control.pending().is_empty());
        }
        control.states[0].num_docs = 1000;
        let state = control.states[0];
        policy.on_insert(&mut control, &state);
        assert_eq!(control.pending(), vec![0]);
    }

    #[test]
    fn test_ram_marks_largest_non_pending() {
        // 1 MB buffer
        let policy = policy(None, Some(1.0), None);
        let mut control =
            FakeControl::with_states(&[(300_000, 3), (600_000, 2), (600_000, 9), (0, 0)]);
        let caller = control.states[0];
        policy.on_insert(&mut control, &caller);
        // ties keep the first maximum
        assert_eq!(control.pending(), vec![1]);

        // below the limit once state 1 no longer counts as active
        let caller = control.states[0];
        policy.on_insert(&mut control, &caller);
        assert_eq!(control.pending(), vec![1]);
    }

    #[test]
    fn test_ram_ties_go_to_earliest_state() {
        let policy = policy(None, Some(1.0), None);
        let mut control = FakeControl::with_states(&[(10, 1), (600_000, 4), (600_000, 4)]);
        let caller = control.states[2];
        policy.on_insert(&mut control, &caller);
        assert_eq!(control.pending(), vec![1]);
    }

    #[test]
    fn test_ram_never_marks_empty_state() {
        let policy = policy(None, Some(1.0), None);
        let mut control = FakeControl::with_states(&[(10, 1), (0, 0)]);
        control.states[1].bytes_used = 2 * 1024 * 1024;
        let caller = control.states[0];
        policy.on_insert(&mut control, &caller);
        assert_eq!(control.pending(), vec![0]);
    }

    #[test]
    fn test_delete_terms_trigger_apply_all() {
        let policy = policy(Some(10), None, Some(3));
        let mut control = FakeControl::with_states(&[(10, 1)]);
        control.delete_terms = 2;
        policy.on_delete(&mut control, None);
        assert!(!control.apply_all_deletes);
        control.delete_terms = 3;
        policy.on_delete(&mut control, None);
        assert!(control.apply_all_deletes);
    }

    #[test]
    fn test_update_runs_insert_and_delete() {
        let policy = policy(Some(1), None, Some(1));
        let mut control = FakeControl::with_states(&[(10, 1)]);
        control.delete_terms = 1;
        let caller = control.states[0];
        policy.on_update(&mut control, &caller);
        assert_eq!(control.pending(), vec![0]);
        assert!(control.apply_all_deletes);
    }
}
