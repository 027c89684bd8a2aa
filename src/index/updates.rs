//! Buffered deletes and doc-value updates.
//!
//! Every delete or update call is frozen into a [`FrozenBufferedUpdates`]
//! packet and pushed onto the [`BufferedUpdatesStream`], which stamps it with
//! a generation. Per-thread writers pull new packets before each document and
//! record them in their own [`BufferedUpdates`] with the doc id bound at pull
//! time. Segments remember the last generation they absorbed; packets with a
//! higher generation are later replayed against them through a
//! [`CoalescedUpdates`] view.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;
use parking_lot::Mutex;

use crate::document::{DocId, Term};
use crate::error::Result;
use crate::reader::LeafReader;
use crate::util::merge_iter::MergeIterator;

/// Doc id bound meaning "every document of the segment".
pub const ALL_DOCS: DocId = DocId::MAX;

pub const BYTES_PER_DEL_TERM: usize = 6 * mem::size_of::<usize>();
pub const BYTES_PER_DEL_QUERY: usize = 4 * mem::size_of::<usize>() + 28;
pub const BYTES_PER_DV_UPDATE: usize = 8 * mem::size_of::<usize>();

/// A delete criterion that can be evaluated against one segment.
///
/// Queries are keyed by their `Display` form: two queries that print the same
/// are the same delete.
pub trait DeleteQuery: Send + Sync + fmt::Debug + fmt::Display {
    /// Matching documents of `reader`, in increasing order.
    fn matching_docs(&self, reader: &dyn LeafReader) -> Result<Vec<DocId>>;
}

/// Matches every document containing a term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermQuery {
    term: Term,
}

impl TermQuery {
    pub fn new(term: Term) -> Self {
        TermQuery { term }
    }
}

impl fmt::Display for TermQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.term)
    }
}

impl DeleteQuery for TermQuery {
    fn matching_docs(&self, reader: &dyn LeafReader) -> Result<Vec<DocId>> {
        reader.docs_with_term(&self.term)
    }
}

/// Set (or clear, with `None`) a numeric doc value on every document
/// containing `term`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericDocValuesUpdate {
    pub term: Term,
    pub field: String,
    pub value: Option<i64>,
    pub doc_id_upto: DocId,
}

/// Binary counterpart of [`NumericDocValuesUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryDocValuesUpdate {
    pub term: Term,
    pub field: String,
    pub value: Option<Vec<u8>>,
    pub doc_id_upto: DocId,
}

/// Mutable updates held by one writer against its own buffered documents.
#[derive(Debug, Default)]
pub struct BufferedUpdates {
    terms: AHashMap<Term, DocId>,
    queries: AHashMap<String, (Arc<dyn DeleteQuery>, DocId)>,
    numeric_updates: Vec<NumericDocValuesUpdate>,
    binary_updates: Vec<BinaryDocValuesUpdate>,
    num_term_deletes: usize,
    bytes_used: usize,
}

impl BufferedUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete documents below `doc_id_upto` containing `term`. A later call
    /// with a lower bound never shrinks an existing one.
    pub fn add_term(&mut self, term: Term, doc_id_upto: DocId) {
        match self.terms.get_mut(&term) {
            Some(current) if doc_id_upto <= *current => return,
            Some(current) => *current = doc_id_upto,
            None => {
                self.bytes_used += BYTES_PER_DEL_TERM + term.ram_bytes();
                self.terms.insert(term, doc_id_upto);
            }
        }
        self.num_term_deletes += 1;
    }

    pub fn add_query(&mut self, query: Arc<dyn DeleteQuery>, doc_id_upto: DocId) {
        let key = query.to_string();
        if self.queries.insert(key.clone(), (query, doc_id_upto)).is_none() {
            self.bytes_used += BYTES_PER_DEL_QUERY + key.len();
        }
    }

    pub fn add_numeric_update(&mut self, update: NumericDocValuesUpdate) {
        self.bytes_used += BYTES_PER_DV_UPDATE + update.term.ram_bytes() + update.field.len();
        self.numeric_updates.push(update);
    }

    pub fn add_binary_update(&mut self, update: BinaryDocValuesUpdate) {
        self.bytes_used += BYTES_PER_DV_UPDATE
            + update.term.ram_bytes()
            + update.field.len()
            + update.value.as_ref().map_or(0, Vec::len);
        self.binary_updates.push(update);
    }

    /// Record every entry of a pushed packet, bounded at `doc_id_upto`.
    pub fn absorb(&mut self, packet: &FrozenBufferedUpdates, doc_id_upto: DocId) {
        for term in packet.terms.iter() {
            self.add_term(term.clone(), doc_id_upto);
        }
        for (query, _) in &packet.queries {
            self.add_query(query.clone(), doc_id_upto);
        }
        for update in &packet.numeric_updates {
            let mut update = update.clone();
            update.doc_id_upto = doc_id_upto;
            self.add_numeric_update(update);
        }
        for update in &packet.binary_updates {
            let mut update = update.clone();
            update.doc_id_upto = doc_id_upto;
            self.add_binary_update(update);
        }
    }

    /// Doc id bound of a term delete, if the term is deleted.
    pub fn term_limit(&self, term: &Term) -> Option<DocId> {
        self.terms.get(term).copied()
    }

    /// Buffered term deletes of one field with their doc id bounds.
    pub fn term_deletes<'a>(&'a self, field: &'a str) -> impl Iterator<Item = (&'a Term, DocId)> + 'a {
        self.terms
            .iter()
            .filter(move |(term, _)| term.field == field)
            .map(|(term, &limit)| (term, limit))
    }

    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    pub fn num_unique_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty()
            || !self.queries.is_empty()
            || !self.numeric_updates.is_empty()
            || !self.binary_updates.is_empty()
    }

    /// Drop term deletes once they were applied while flushing postings.
    pub fn clear_terms(&mut self) {
        let freed: usize = self
            .terms
            .keys()
            .map(|t| BYTES_PER_DEL_TERM + t.ram_bytes())
            .sum();
        self.bytes_used -= freed;
        self.terms.clear();
        self.num_term_deletes = 0;
    }

    pub fn clear(&mut self) {
        *self = BufferedUpdates::default();
    }

    /// Freeze into an immutable packet with sorted terms. Leaves `self` empty.
    pub fn freeze(&mut self, is_segment_private: bool) -> FrozenBufferedUpdates {
        debug_assert!(!is_segment_private || self.terms.is_empty());
        let buffered = mem::take(self);

        let mut terms: Vec<Term> = buffered.terms.into_keys().collect();
        terms.sort();
        let mut queries: Vec<(Arc<dyn DeleteQuery>, DocId)> =
            buffered.queries.into_values().collect();
        queries.sort_by_key(|(q, _)| q.to_string());

        FrozenBufferedUpdates {
            terms: terms.into(),
            queries,
            numeric_updates: buffered.numeric_updates,
            binary_updates: buffered.binary_updates,
            num_term_deletes: buffered.num_term_deletes,
            bytes_used: buffered.bytes_used,
            generation: None,
            is_segment_private,
        }
    }
}

/// An immutable batch of deletes and updates.
#[derive(Debug)]
pub struct FrozenBufferedUpdates {
    /// Sorted, unique.
    terms: Arc<[Term]>,
    queries: Vec<(Arc<dyn DeleteQuery>, DocId)>,
    numeric_updates: Vec<NumericDocValuesUpdate>,
    binary_updates: Vec<BinaryDocValuesUpdate>,
    num_term_deletes: usize,
    bytes_used: usize,
    generation: Option<u64>,
    is_segment_private: bool,
}

impl fmt::Display for FrozenBufferedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "packet generation={:?} terms={} queries={} dv_updates={}",
            self.generation,
            self.terms.len(),
            self.queries.len(),
            self.numeric_updates.len() + self.binary_updates.len()
        )
    }
}

impl FrozenBufferedUpdates {
    /// Packet deleting every document containing one of `terms`.
    pub fn from_terms<I: IntoIterator<Item = Term>>(terms: I) -> Self {
        let mut buffered = BufferedUpdates::new();
        for term in terms {
            buffered.add_term(term, ALL_DOCS);
        }
        buffered.freeze(false)
    }

    pub fn from_queries<I: IntoIterator<Item = Arc<dyn DeleteQuery>>>(queries: I) -> Self {
        let mut buffered = BufferedUpdates::new();
        for query in queries {
            buffered.add_query(query, ALL_DOCS);
        }
        buffered.freeze(false)
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn queries(&self) -> &[(Arc<dyn DeleteQuery>, DocId)] {
        &self.queries
    }

    pub fn numeric_updates(&self) -> &[NumericDocValuesUpdate] {
        &self.numeric_updates
    }

    pub fn binary_updates(&self) -> &[BinaryDocValuesUpdate] {
        &self.binary_updates
    }

    pub fn num_term_deletes(&self) -> usize {
        self.num_term_deletes
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn is_segment_private(&self) -> bool {
        self.is_segment_private
    }

    pub fn any(&self) -> bool {
        !self.terms.is_empty()
            || !self.queries.is_empty()
            || !self.numeric_updates.is_empty()
            || !self.binary_updates.is_empty()
    }

    /// View for replay against the segment this packet belongs to.
    pub fn as_segment_updates(&self) -> SegmentUpdates<'_> {
        SegmentUpdates {
            terms: Box::new(self.terms.iter().map(|t| (t, ALL_DOCS))),
            queries: self
                .queries
                .iter()
                .map(|(q, upto)| (q.as_ref() as &dyn DeleteQuery, *upto))
                .collect(),
            numeric: &self.numeric_updates,
            binary: &self.binary_updates,
        }
    }
}

/// Several pushed packets merged into one view for replay against an older
/// segment. Exact per-packet doc id bounds no longer matter once packets are
/// coalesced, so every entry applies to the whole segment.
#[derive(Debug, Default)]
pub struct CoalescedUpdates {
    term_runs: Vec<Arc<[Term]>>,
    query_index: AHashMap<String, usize>,
    queries: Vec<(Arc<dyn DeleteQuery>, DocId)>,
    numeric_updates: Vec<NumericDocValuesUpdate>,
    binary_updates: Vec<BinaryDocValuesUpdate>,
    total_term_count: usize,
}

impl fmt::Display for CoalescedUpdates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "coalesced runs={} terms={} queries={}",
            self.term_runs.len(),
            self.total_term_count,
            self.queries.len()
        )
    }
}

impl CoalescedUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, packet: &FrozenBufferedUpdates) {
        if !packet.terms.is_empty() {
            self.total_term_count += packet.terms.len();
            self.term_runs.push(packet.terms.clone());
        }
        for (query, _) in &packet.queries {
            let key = query.to_string();
            match self.query_index.get(&key) {
                Some(&i) => self.queries[i] = (query.clone(), ALL_DOCS),
                None => {
                    self.query_index.insert(key, self.queries.len());
                    self.queries.push((query.clone(), ALL_DOCS));
                }
            }
        }
        self.numeric_updates
            .extend(packet.numeric_updates.iter().map(|u| NumericDocValuesUpdate {
                doc_id_upto: ALL_DOCS,
                ..u.clone()
            }));
        self.binary_updates
            .extend(packet.binary_updates.iter().map(|u| BinaryDocValuesUpdate {
                doc_id_upto: ALL_DOCS,
                ..u.clone()
            }));
    }

    /// All terms of all packets in order, duplicates kept, merged lazily.
    pub fn terms_iterable(&self) -> MergeIterator<std::slice::Iter<'_, Term>> {
        MergeIterator::new(self.term_runs.iter().map(|run| run.iter()))
    }

    pub fn queries_iterable(&self) -> impl Iterator<Item = (&Arc<dyn DeleteQuery>, DocId)> {
        self.queries.iter().map(|(q, limit)| (q, *limit))
    }

    pub fn numeric_updates(&self) -> &[NumericDocValuesUpdate] {
        &self.numeric_updates
    }

    pub fn binary_updates(&self) -> &[BinaryDocValuesUpdate] {
        &self.binary_updates
    }

    pub fn total_term_count(&self) -> usize {
        self.total_term_count
    }

    pub fn any(&self) -> bool {
        self.total_term_count > 0
            || !self.queries.is_empty()
            || !self.numeric_updates.is_empty()
            || !self.binary_updates.is_empty()
    }

    pub fn as_segment_updates(&self) -> SegmentUpdates<'_> {
        SegmentUpdates {
            terms: Box::new(self.terms_iterable().map(|t| (t, ALL_DOCS))),
            queries: self
                .queries_iterable()
                .map(|(q, limit)| (q.as_ref() as &dyn DeleteQuery, limit))
                .collect(),
            numeric: &self.numeric_updates,
            binary: &self.binary_updates,
        }
    }
}

/// Everything to replay against one segment, borrowed from a packet or a
/// coalesced view. Terms come in sorted order.
pub struct SegmentUpdates<'a> {
    pub terms: Box<dyn Iterator<Item = (&'a Term, DocId)> + 'a>,
    pub queries: Vec<(&'a dyn DeleteQuery, DocId)>,
    pub numeric: &'a [NumericDocValuesUpdate],
    pub binary: &'a [BinaryDocValuesUpdate],
}

#[derive(Debug, Default)]
struct StreamState {
    packets: Vec<Arc<FrozenBufferedUpdates>>,
    next_gen: u64,
    bytes_used: usize,
    num_terms: usize,
    /// Generation each live writer has pulled up to, with multiplicity.
    subscribers: BTreeMap<u64, usize>,
}

/// Ordered log of pushed packets.
#[derive(Debug)]
pub struct BufferedUpdatesStream {
    state: Mutex<StreamState>,
}

impl Default for BufferedUpdatesStream {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedUpdatesStream {
    pub fn new() -> Self {
        BufferedUpdatesStream {
            state: Mutex::new(StreamState {
                next_gen: 1,
                ..StreamState::default()
            }),
        }
    }

    /// Stamp `packet` with the next generation and append it.
    pub fn push(&self, packet: FrozenBufferedUpdates) -> u64 {
        let mut state = self.state.lock();
        Self::push_locked(&mut state, packet)
    }

    fn push_locked(state: &mut StreamState, mut packet: FrozenBufferedUpdates) -> u64 {
        let generation = state.next_gen;
        state.next_gen += 1;
        packet.generation = Some(generation);
        state.bytes_used += packet.bytes_used;
        state.num_terms += packet.num_term_deletes;
        debug!("push {packet}");
        state.packets.push(Arc::new(packet));
        generation
    }

    /// Push `packet` for a subscriber at `seen_gen` and pull every packet up
    /// to and including it in one step. Packets pushed afterwards stay for
    /// the next pull.
    pub fn push_and_pull(
        &self,
        seen_gen: u64,
        packet: FrozenBufferedUpdates,
    ) -> (Vec<Arc<FrozenBufferedUpdates>>, u64) {
        let mut state = self.state.lock();
        let generation = Self::push_locked(&mut state, packet);
        let packets = Self::packets_between(&state, seen_gen, generation);
        Self::move_subscription(&mut state, seen_gen, Some(generation));
        (packets, generation)
    }

    fn packets_between(
        state: &StreamState,
        after: u64,
        upto: u64,
    ) -> Vec<Arc<FrozenBufferedUpdates>> {
        state
            .packets
            .iter()
            .filter(|p| p.generation.is_some_and(|g| g > after && g <= upto))
            .cloned()
            .collect()
    }

    /// Generation of the newest packet, 0 if none was ever pushed.
    pub fn last_gen(&self) -> u64 {
        self.state.lock().next_gen - 1
    }

    /// Register a writer that has seen everything up to the current
    /// generation and return that generation.
    pub fn subscribe(&self) -> u64 {
        let mut state = self.state.lock();
        let generation = state.next_gen - 1;
        *state.subscribers.entry(generation).or_default() += 1;
        generation
    }

    /// Packets newer than `seen_gen`, and the generation the subscriber has
    /// now seen. Moves the subscription forward.
    pub fn pull(&self, seen_gen: u64) -> (Vec<Arc<FrozenBufferedUpdates>>, u64) {
        let mut state = self.state.lock();
        let newest = state.next_gen - 1;
        if newest == seen_gen {
            return (Vec::new(), seen_gen);
        }
        let packets = Self::packets_between(&state, seen_gen, newest);
        Self::move_subscription(&mut state, seen_gen, Some(newest));
        (packets, newest)
    }

    pub fn unsubscribe(&self, seen_gen: u64) {
        let mut state = self.state.lock();
        Self::move_subscription(&mut state, seen_gen, None);
    }

    fn move_subscription(state: &mut StreamState, from: u64, to: Option<u64>) {
        if let Some(count) = state.subscribers.get_mut(&from) {
            *count -= 1;
            if *count == 0 {
                state.subscribers.remove(&from);
            }
        }
        if let Some(to) = to {
            *state.subscribers.entry(to).or_default() += 1;
        }
    }

    /// Coalesce every packet a segment that absorbed up to `since_gen` has
    /// not seen yet.
    pub fn coalesce(&self, since_gen: u64) -> CoalescedUpdates {
        let state = self.state.lock();
        let mut coalesced = CoalescedUpdates::new();
        for packet in &state.packets {
            if packet.generation.is_some_and(|g| g > since_gen) && !packet.is_segment_private {
                coalesced.update(packet);
            }
        }
        coalesced
    }

    /// Drop packets every segment and every live writer has absorbed.
    pub fn prune(&self, min_segment_gen: u64) {
        let mut state = self.state.lock();
        let min_subscriber = state
            .subscribers
            .keys()
            .next()
            .copied()
            .unwrap_or(u64::MAX);
        let min_gen = min_segment_gen.min(min_subscriber);
        let before = state.packets.len();
        let mut freed_bytes = 0;
        let mut freed_terms = 0;
        state.packets.retain(|p| {
            let keep = p.generation.is_some_and(|g| g > min_gen);
            if !keep {
                freed_bytes += p.bytes_used;
                freed_terms += p.num_term_deletes;
            }
            keep
        });
        state.bytes_used -= freed_bytes;
        state.num_terms -= freed_terms;
        if state.packets.len() != before {
            debug!(
                "pruned {} packets at generation {min_gen}",
                before - state.packets.len()
            );
        }
    }

    pub fn bytes_used(&self) -> usize {
        self.state.lock().bytes_used
    }

    pub fn num_terms(&self) -> usize {
        self.state.lock().num_terms
    }

    pub fn num_packets(&self) -> usize {
        self.state.lock().packets.len()
    }

    pub fn any(&self) -> bool {
        !self.state.lock().packets.is_empty()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.packets.clear();
        state.bytes_used = 0;
        state.num_terms = 0;
    }
}
