//! The multi-threaded documents writer.
//!
//! [`DocumentsWriter`] hands every indexing thread a per-thread buffer from
//! the thread-state pool, lets [`FlushControl`] decide when buffers flush,
//! publishes flushed segments into a [`SegmentStore`] and replays deletes and
//! doc-value updates onto published segments.
//!
//! Every published segment remembers the generation of the newest update
//! packet applied to it. Applying all deletes coalesces the packets newer
//! than each segment's generation, applies them and lets the stream prune
//! what no segment or buffer still needs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use ahash::AHashSet;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::document::{DocId, Document, MAX_DOCS, Term};
use crate::error::{IrisError, Result};
use crate::index::config::IndexWriterConfig;
use crate::index::flush_control::{FlushControl, FlushStats};
use crate::index::flush_policy::FlushByRamOrCountsPolicy;
use crate::index::merge_scheduler::{
    MergeScheduler, MergeSource, MergeTrigger, OneMerge, create_merge_scheduler,
};
use crate::index::per_thread::{DocumentsWriterPerThread, FlushedSegment};
use crate::index::sink::SegmentStore;
use crate::index::thread_pool::{PerThreadBuffer, ThreadStatePool};
use crate::index::updates::{
    ALL_DOCS, BinaryDocValuesUpdate, BufferedUpdates, BufferedUpdatesStream, DeleteQuery,
    FrozenBufferedUpdates, NumericDocValuesUpdate,
};
use crate::reader::{BaseCompositeReader, IndexReaderRef};

/// A published segment and the newest update generation applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEntry {
    pub name: String,
    pub max_doc: DocId,
    pub del_gen: u64,
}

#[derive(Debug, Default)]
struct MergeQueue {
    pending: VecDeque<OneMerge>,
    /// Segments taken by a pending or running merge.
    merging: AHashSet<String>,
}

pub struct DocumentsWriter {
    config: IndexWriterConfig,
    store: Arc<dyn SegmentStore>,
    updates: Arc<BufferedUpdatesStream>,
    flush_control: FlushControl<DocumentsWriterPerThread>,
    segments: Mutex<Vec<SegmentEntry>>,
    merges: Mutex<MergeQueue>,
    merge_scheduler: Box<dyn MergeScheduler>,
    segment_counter: AtomicU64,
    /// Buffered plus published documents, checked against `MAX_DOCS`.
    pending_num_docs: AtomicI64,
    full_flush_lock: Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DocumentsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentsWriter")
            .field("segments", &*self.segments.lock())
            .field("pending_num_docs", &self.pending_num_docs.load(Ordering::Acquire))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// Segment names count up in base 36 after the configured prefix.
fn segment_name(prefix: &str, counter: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut digits = Vec::new();
    let mut value = counter;
    loop {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    digits.reverse();
    format!("{prefix}{}", String::from_utf8_lossy(&digits))
}

/// First counter value whose name does not collide with `existing`.
fn next_segment_counter(prefix: &str, existing: &[String]) -> u64 {
    existing
        .iter()
        .filter_map(|name| name.strip_prefix(prefix))
        .filter_map(|digits| u64::from_str_radix(digits, 36).ok())
        .map(|counter| counter + 1)
        .max()
        .unwrap_or(0)
}

impl DocumentsWriter {
    pub fn new(config: IndexWriterConfig, store: Arc<dyn SegmentStore>) -> Result<Self> {
        config.validate()?;
        let updates = Arc::new(BufferedUpdatesStream::new());
        let pool = Arc::new(ThreadStatePool::new(config.max_thread_states));
        let policy = Box::new(FlushByRamOrCountsPolicy::new(&config));
        let flush_control = FlushControl::new(&config, pool, updates.clone(), policy);
        let merge_scheduler = create_merge_scheduler(config.merge_scheduler);

        let existing = store.segment_names();
        let segments: Vec<SegmentEntry> = existing
            .iter()
            .map(|name| {
                store.open_leaf(name).map(|leaf| SegmentEntry {
                    name: name.clone(),
                    max_doc: leaf.max_doc(),
                    del_gen: 0,
                })
            })
            .collect::<Result<_>>()?;
        let pending_num_docs: i64 = segments.iter().map(|s| s.max_doc as i64).sum();

        info!(
            "opened documents writer with {} existing segments and {:?}",
            segments.len(),
            config
        );
        Ok(DocumentsWriter {
            segment_counter: AtomicU64::new(next_segment_counter(&config.segment_prefix, &existing)),
            config,
            store,
            updates,
            flush_control,
            segments: Mutex::new(segments),
            merges: Mutex::new(MergeQueue::default()),
            merge_scheduler,
            pending_num_docs: AtomicI64::new(pending_num_docs),
            full_flush_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &IndexWriterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SegmentStore> {
        &self.store
    }

    pub fn flush_control(&self) -> &FlushControl<DocumentsWriterPerThread> {
        &self.flush_control
    }

    pub fn updates(&self) -> &Arc<BufferedUpdatesStream> {
        &self.updates
    }

    pub fn flush_stats(&self) -> FlushStats {
        self.flush_control.stats()
    }

    /// Published segments in index order.
    pub fn segments(&self) -> Vec<SegmentEntry> {
        self.segments.lock().clone()
    }

    /// Documents buffered or published, deleted ones included until they are
    /// merged away.
    pub fn pending_num_docs(&self) -> i64 {
        self.pending_num_docs.load(Ordering::Acquire)
    }

    /// Documents buffered in thread states that have not been checked out
    /// for flushing.
    pub fn num_buffered_docs(&self) -> usize {
        self.flush_control
            .pool()
            .active_thread_states()
            .iter()
            .map(|state| state.num_docs())
            .sum()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(IrisError::already_closed("documents writer is closed"));
        }
        Ok(())
    }

    fn next_segment_name(&self) -> String {
        let counter = self.segment_counter.fetch_add(1, Ordering::AcqRel);
        segment_name(&self.config.segment_prefix, counter)
    }

    fn reserve_docs(&self, count: i64) -> Result<()> {
        let after = self.pending_num_docs.fetch_add(count, Ordering::AcqRel) + count;
        if after > MAX_DOCS as i64 {
            self.pending_num_docs.fetch_sub(count, Ordering::AcqRel);
            return Err(IrisError::capacity(format!(
                "number of documents in the index cannot exceed {MAX_DOCS}"
            )));
        }
        Ok(())
    }

    fn release_docs(&self, count: i64) {
        if count > 0 {
            self.pending_num_docs.fetch_sub(count, Ordering::AcqRel);
        }
    }

    pub fn add_document(&self, doc: &Document) -> Result<()> {
        self.update_document(doc, None)
    }

    /// Add `doc`, first deleting every document added earlier that contains
    /// `del_term`.
    pub fn update_document(&self, doc: &Document, del_term: Option<Term>) -> Result<()> {
        self.ensure_open()?;
        self.pre_update()?;
        self.reserve_docs(1)?;

        let is_update = del_term.is_some();
        let mut locked = match self.flush_control.pool().get_and_lock() {
            Ok(locked) => locked,
            Err(e) => {
                self.release_docs(1);
                return Err(e);
            }
        };
        if locked.writer().is_none() {
            let name = self.next_segment_name();
            locked.install(DocumentsWriterPerThread::new(name, self.updates.clone()));
        }
        let buffered = locked.writer().map_or(0, |w| w.num_docs() as i64);
        let result = match locked.writer_mut() {
            Some(writer) => writer.update_document(doc, del_term),
            None => Err(IrisError::internal("thread state lost its writer")),
        };
        if let Err(e) = result {
            self.release_docs(1);
            if locked.writer().is_some_and(|w| w.is_aborted()) {
                // an aborted buffer is dropped along with its documents
                self.flush_control.do_on_abort(&mut locked);
                self.release_docs(buffered);
            }
            return Err(e);
        }
        let flushing = self.flush_control.do_after_document(&mut locked, is_update);
        drop(locked);

        self.post_update(flushing)
    }

    /// Help flushing while threads are stalled or flushes are queued.
    fn pre_update(&self) -> Result<()> {
        if !self.flush_control.any_stalled_threads() && self.flush_control.num_queued_flushes() == 0 {
            return Ok(());
        }
        loop {
            while let Some(writer) = self.flush_control.next_pending_flush() {
                self.flush_writer(writer)?;
            }
            self.flush_control.wait_if_stalled();
            if self.flush_control.num_queued_flushes() == 0 {
                return Ok(());
            }
        }
    }

    fn post_update(&self, flushing: Option<DocumentsWriterPerThread>) -> Result<()> {
        let flushing = flushing.or_else(|| self.flush_control.next_pending_flush());
        if let Some(writer) = flushing {
            self.do_flush(writer)?;
        }
        self.maybe_apply_all_deletes()
    }

    /// Delete every document containing any of `terms`.
    pub fn delete_terms<I: IntoIterator<Item = Term>>(&self, terms: I) -> Result<()> {
        self.ensure_open()?;
        let packet = FrozenBufferedUpdates::from_terms(terms);
        self.push_updates(packet)
    }

    /// Delete every document matching any of `queries`.
    pub fn delete_queries<I>(&self, queries: I) -> Result<()>
    where
        I: IntoIterator<Item = Arc<dyn DeleteQuery>>,
    {
        self.ensure_open()?;
        let packet = FrozenBufferedUpdates::from_queries(queries);
        self.push_updates(packet)
    }

    /// Set (or clear) numeric doc value `field` on every document containing
    /// `term`.
    pub fn update_numeric_doc_value(&self, term: Term, field: &str, value: Option<i64>) -> Result<()> {
        self.ensure_open()?;
        let mut updates = BufferedUpdates::new();
        updates.add_numeric_update(NumericDocValuesUpdate {
            term,
            field: field.to_string(),
            value,
            doc_id_upto: ALL_DOCS,
        });
        self.push_updates(updates.freeze(false))
    }

    pub fn update_binary_doc_value(&self, term: Term, field: &str, value: Option<Vec<u8>>) -> Result<()> {
        self.ensure_open()?;
        let mut updates = BufferedUpdates::new();
        updates.add_binary_update(BinaryDocValuesUpdate {
            term,
            field: field.to_string(),
            value,
            doc_id_upto: ALL_DOCS,
        });
        self.push_updates(updates.freeze(false))
    }

    fn push_updates(&self, packet: FrozenBufferedUpdates) -> Result<()> {
        if !packet.any() {
            return Ok(());
        }
        let generation = self.updates.push(packet);
        debug!("pushed update packet gen {generation}");
        self.flush_control.do_on_delete();
        self.maybe_apply_all_deletes()
    }

    fn maybe_apply_all_deletes(&self) -> Result<()> {
        if self.flush_control.get_and_reset_apply_all_deletes() {
            self.apply_all_deletes()?;
        }
        Ok(())
    }

    /// Flush `writer`, then keep helping with pending flushes.
    fn do_flush(&self, writer: DocumentsWriterPerThread) -> Result<()> {
        let mut next = Some(writer);
        while let Some(writer) = next {
            self.flush_writer(writer)?;
            next = self.flush_control.next_pending_flush();
        }
        self.maybe_merge(MergeTrigger::SegmentFlush)
    }

    /// Flush one checked-out writer and publish its segment.
    fn flush_writer(&self, mut writer: DocumentsWriterPerThread) -> Result<()> {
        let name = writer.segment_name().to_string();
        let num_docs = writer.num_docs() as i64;
        let result = if num_docs == 0 {
            Ok(())
        } else {
            writer
                .flush(self.store.as_ref())
                .and_then(|flushed| self.publish(flushed))
        };
        if let Err(e) = &result {
            warn!("flush of segment {name} failed: {e}");
            self.release_docs(num_docs);
        }
        self.flush_control.after_flush(&name);
        // unsubscribes from the update stream
        drop(writer);
        result
    }

    fn publish(&self, flushed: FlushedSegment) -> Result<()> {
        let mut segments = self.segments.lock();
        let mut deleted = flushed.del_count as i64;
        if let Some(private) = &flushed.private_updates {
            let applied = self.store.apply_updates(&flushed.name, private.as_segment_updates());
            match applied {
                Ok(count) => deleted += count as i64,
                Err(e) => {
                    if let Err(drop_error) = self.store.drop_segment(&flushed.name) {
                        warn!("cannot drop segment {}: {drop_error}", flushed.name);
                    }
                    return Err(e);
                }
            }
        }
        if deleted >= flushed.max_doc as i64 {
            info!("segment {} is fully deleted; dropping it", flushed.name);
            self.store.drop_segment(&flushed.name)?;
            self.release_docs(flushed.max_doc as i64);
            return Ok(());
        }
        segments.push(SegmentEntry {
            name: flushed.name,
            max_doc: flushed.max_doc,
            del_gen: flushed.del_gen,
        });
        Ok(())
    }

    /// Apply every buffered update packet to every published segment.
    /// Returns the number of newly deleted documents.
    pub fn apply_all_deletes(&self) -> Result<u64> {
        let mut segments = self.segments.lock();
        self.apply_all_deletes_locked(&mut segments)
    }

    fn apply_all_deletes_locked(&self, segments: &mut Vec<SegmentEntry>) -> Result<u64> {
        let last_gen = self.updates.last_gen();
        let mut deleted = 0;
        let mut emptied = Vec::new();
        for entry in segments.iter_mut() {
            if entry.del_gen >= last_gen {
                continue;
            }
            let coalesced = self.updates.coalesce(entry.del_gen);
            if coalesced.any() {
                let count = self
                    .store
                    .apply_updates(&entry.name, coalesced.as_segment_updates())?;
                if count > 0 {
                    deleted += count;
                    let leaf = self.store.open_leaf(&entry.name)?;
                    if leaf.num_docs() == 0 {
                        emptied.push(entry.name.clone());
                    }
                }
            }
            entry.del_gen = last_gen;
        }

        if !emptied.is_empty() {
            let merges = self.merges.lock();
            for name in emptied {
                if merges.merging.contains(&name) {
                    continue;
                }
                self.store.drop_segment(&name)?;
                if let Some(index) = segments.iter().position(|s| s.name == name) {
                    let entry = segments.remove(index);
                    self.release_docs(entry.max_doc as i64);
                }
                info!("dropped fully deleted segment {name}");
            }
        }

        let min_gen = segments.iter().map(|s| s.del_gen).min().unwrap_or(last_gen);
        self.updates.prune(min_gen);
        debug!("applied deletes up to gen {last_gen}: {deleted} documents deleted");
        Ok(deleted)
    }

    /// Flush every buffered document and apply all pending updates.
    ///
    /// Returns whether anything was flushed.
    pub fn flush_all_threads(&self) -> Result<bool> {
        self.ensure_open()?;
        let flushed = self.full_flush()?;
        self.maybe_merge(MergeTrigger::FullFlush)?;
        Ok(flushed)
    }

    fn full_flush(&self) -> Result<bool> {
        let _full_flush = self.full_flush_lock.lock();
        self.flush_control.mark_for_full_flush();
        let mut any_flushed = false;
        let mut result = Ok(());
        while let Some(writer) = self.flush_control.next_pending_flush() {
            any_flushed = true;
            if let Err(e) = self.flush_writer(writer) {
                result = Err(e);
                break;
            }
        }
        if let Err(e) = result {
            for mut writer in self.flush_control.abort_full_flush() {
                self.release_docs(writer.num_docs() as i64);
                if let Err(abort_error) = writer.abort() {
                    warn!("abort of {} failed: {abort_error}", writer.segment_name());
                }
            }
            return Err(e);
        }
        self.flush_control.wait_for_flush();
        self.flush_control.finish_full_flush();

        // writers parked while the full flush ran
        while let Some(writer) = self.flush_control.next_pending_flush() {
            any_flushed = true;
            self.flush_writer(writer)?;
        }
        self.apply_all_deletes()?;
        info!("full flush done; {} segments", self.segments.lock().len());
        Ok(any_flushed)
    }

    /// Composite reader over every published segment, after applying all
    /// pending updates.
    pub fn open_reader(&self) -> Result<Arc<BaseCompositeReader>> {
        self.ensure_open()?;
        let mut segments = self.segments.lock();
        self.apply_all_deletes_locked(&mut segments)?;
        let leaves = segments
            .iter()
            .map(|entry| self.store.open_leaf(&entry.name).map(IndexReaderRef::Leaf))
            .collect::<Result<Vec<_>>>()?;
        BaseCompositeReader::new(leaves)
    }

    /// Register a merge of `sources` into a new segment and let the merge
    /// scheduler run it. Returns the name of the merged segment.
    pub fn request_merge(&self, sources: &[&str]) -> Result<String> {
        self.ensure_open()?;
        if sources.is_empty() {
            return Err(IrisError::invalid_argument("a merge needs at least one segment"));
        }
        let target = {
            let segments = self.segments.lock();
            let mut merges = self.merges.lock();
            for name in sources {
                if !segments.iter().any(|s| s.name == *name) {
                    return Err(IrisError::invalid_argument(format!(
                        "segment {name} is not published"
                    )));
                }
                if merges.merging.contains(*name) {
                    return Err(IrisError::invalid_operation(format!(
                        "segment {name} is already being merged"
                    )));
                }
            }
            let target = self.next_segment_name();
            merges.merging.extend(sources.iter().map(|s| s.to_string()));
            merges.pending.push_back(OneMerge {
                segments: sources.iter().map(|s| s.to_string()).collect(),
                target: target.clone(),
            });
            target
        };
        debug!("registered merge of {sources:?} into {target}");
        self.maybe_merge(MergeTrigger::Explicit)?;
        Ok(target)
    }

    /// Register a merge of every published segment into one.
    pub fn force_merge(&self) -> Result<Option<String>> {
        let names: Vec<String> = self.segments.lock().iter().map(|s| s.name.clone()).collect();
        if names.len() < 2 {
            return Ok(None);
        }
        let sources: Vec<&str> = names.iter().map(String::as_str).collect();
        self.request_merge(&sources).map(Some)
    }

    pub fn maybe_merge(&self, trigger: MergeTrigger) -> Result<()> {
        if !self.has_pending_merges() {
            return Ok(());
        }
        self.merge_scheduler.merge(self, trigger)
    }

    fn run_merge(&self, merge: &OneMerge) -> Result<()> {
        let mut segments = self.segments.lock();
        // the merged segment starts out with every update applied
        self.apply_all_deletes_locked(&mut segments)?;
        let del_gen = self.updates.last_gen();

        let source_docs: i64 = segments
            .iter()
            .filter(|s| merge.segments.contains(&s.name))
            .map(|s| s.max_doc as i64)
            .sum();
        let max_doc = self.store.merge(&merge.segments, &merge.target)?;

        let position = segments
            .iter()
            .position(|s| merge.segments.contains(&s.name))
            .unwrap_or(segments.len());
        segments.retain(|s| !merge.segments.contains(&s.name));
        if max_doc == 0 {
            self.store.drop_segment(&merge.target)?;
        } else {
            let at = position.min(segments.len());
            segments.insert(
                at,
                SegmentEntry {
                    name: merge.target.clone(),
                    max_doc,
                    del_gen,
                },
            );
        }
        self.release_docs(source_docs - max_doc as i64);
        info!(
            "merged {:?} into {} with {max_doc} documents",
            merge.segments, merge.target
        );
        Ok(())
    }

    /// Flush everything, run pending merges and stop accepting documents.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let result = self
            .full_flush()
            .and_then(|_| self.maybe_merge(MergeTrigger::Closing));
        self.closed.store(true, Ordering::Release);
        self.shutdown();
        let closed = self.merge_scheduler.close();
        info!("documents writer closed");
        result.and(closed)
    }

    /// Discard every buffered document and pending update and stop accepting
    /// documents. Published segments stay in the store.
    pub fn rollback(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _full_flush = self.full_flush_lock.lock();
        for mut writer in self.flush_control.abort_pending_flushes() {
            self.release_docs(writer.num_docs() as i64);
            if let Err(e) = writer.abort() {
                warn!("abort of {} failed: {e}", writer.segment_name());
            }
        }
        self.shutdown();
        self.flush_control.wait_for_flush();
        self.updates.clear();
        self.merges.lock().pending.clear();
        self.merge_scheduler.close()?;
        warn!("documents writer rolled back");
        Ok(())
    }

    fn shutdown(&self) {
        self.flush_control.set_closed();
        for mut writer in self.flush_control.pool().deactivate_unreleased() {
            self.release_docs(writer.num_docs() as i64);
            if let Err(e) = writer.abort() {
                warn!("abort of {} failed: {e}", writer.segment_name());
            }
        }
    }
}

impl MergeSource for DocumentsWriter {
    fn next_merge(&self) -> Option<OneMerge> {
        self.merges.lock().pending.pop_front()
    }

    fn has_pending_merges(&self) -> bool {
        !self.merges.lock().pending.is_empty()
    }

    fn merge(&self, merge: OneMerge) -> Result<()> {
        let result = self.run_merge(&merge);
        let mut merges = self.merges.lock();
        for name in &merge.segments {
            merges.merging.remove(name);
        }
        result
    }
}

impl Drop for DocumentsWriter {
    fn drop(&mut self) {
        if !self.is_closed() {
            debug!("documents writer dropped without close; discarding buffered documents");
            self.closed.store(true, Ordering::Release);
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Field, StoredValue};
    use crate::index::config::MergeSchedulerKind;
    use crate::index::segment::MemorySegmentStore;
    use crate::index::updates::TermQuery;

    fn doc(id: &str, body: &str) -> Document {
        Document::builder()
            .add_field(Field::keyword("id", id).store(StoredValue::Text(id.to_string())))
            .add_tokens("body", body.split_whitespace())
            .add_numeric("rank", 1)
            .build()
    }

    fn writer(config: IndexWriterConfig) -> (DocumentsWriter, MemorySegmentStore) {
        let store = MemorySegmentStore::new();
        let writer = DocumentsWriter::new(config, Arc::new(store.clone())).unwrap();
        (writer, store)
    }

    #[test]
    fn test_segment_names_count_in_base_36() {
        assert_eq!(segment_name("_", 0), "_0");
        assert_eq!(segment_name("_", 35), "_z");
        assert_eq!(segment_name("seg", 36), "seg10");
        let existing = vec!["_3".to_string(), "_a".to_string(), "other".to_string()];
        assert_eq!(next_segment_counter("_", &existing), 11);
    }

    #[test]
    fn test_flush_by_doc_count() {
        let config = IndexWriterConfig::new()
            .with_ram_buffer_size_mb(None)
            .with_max_buffered_docs(Some(2))
            .with_max_thread_states(1);
        let (writer, store) = writer(config);
        for i in 0..5 {
            writer.add_document(&doc(&i.to_string(), "hello world")).unwrap();
        }
        assert_eq!(store.segment_names().len(), 2);
        assert_eq!(writer.num_buffered_docs(), 1);

        assert!(writer.flush_all_threads().unwrap());
        assert_eq!(writer.segments().len(), 3);
        let reader = writer.open_reader().unwrap();
        assert_eq!(reader.max_doc(), 5);
        assert_eq!(reader.doc_freq(&Term::new("body", "hello")).unwrap(), Some(5));
        assert_eq!(writer.flush_stats().active_bytes, 0);
    }

    #[test]
    fn test_deletes_reach_published_and_buffered_docs() {
        let config = IndexWriterConfig::new().with_max_thread_states(1);
        let (writer, _store) = writer(config);
        writer.add_document(&doc("1", "red")).unwrap();
        writer.flush_all_threads().unwrap();
        writer.add_document(&doc("2", "red")).unwrap();
        writer.delete_terms([Term::new("body", "red")]).unwrap();
        writer.add_document(&doc("3", "red")).unwrap();
        writer.flush_all_threads().unwrap();

        let reader = writer.open_reader().unwrap();
        assert_eq!(reader.num_docs(), 1);
        assert_eq!(writer.segments().len(), 1);
        // nothing is left to replay
        assert_eq!(writer.updates().num_packets(), 0);
    }

    #[test]
    fn test_update_document_replaces() {
        let (writer, _store) = writer(IndexWriterConfig::new());
        writer.add_document(&doc("1", "old")).unwrap();
        writer.flush_all_threads().unwrap();
        writer
            .update_document(&doc("1", "new"), Some(Term::new("id", "1")))
            .unwrap();
        writer.flush_all_threads().unwrap();
        let reader = writer.open_reader().unwrap();
        assert_eq!(reader.num_docs(), 1);
        assert_eq!(reader.doc_freq(&Term::new("body", "new")).unwrap(), Some(1));
    }

    #[test]
    fn test_query_delete_and_doc_value_update() {
        let (writer, store) = writer(IndexWriterConfig::new());
        writer.add_document(&doc("1", "a")).unwrap();
        writer.add_document(&doc("2", "b")).unwrap();
        writer.flush_all_threads().unwrap();

        let query: Arc<dyn DeleteQuery> = Arc::new(TermQuery::new(Term::new("id", "1")));
        writer.delete_queries([query]).unwrap();
        writer
            .update_numeric_doc_value(Term::new("id", "2"), "rank", Some(7))
            .unwrap();
        let reader = writer.open_reader().unwrap();
        assert_eq!(reader.num_docs(), 1);

        let name = &writer.segments()[0].name;
        let segment = store.segment(name).unwrap();
        let rank = segment.field("rank").unwrap().numeric.as_ref().unwrap();
        assert_eq!(rank[1], Some(7));
    }

    #[test]
    fn test_fully_deleted_segment_is_dropped() {
        let (writer, store) = writer(IndexWriterConfig::new());
        writer.add_document(&doc("1", "gone")).unwrap();
        writer.flush_all_threads().unwrap();
        assert_eq!(writer.pending_num_docs(), 1);
        writer.delete_terms([Term::new("id", "1")]).unwrap();
        writer.apply_all_deletes().unwrap();
        assert!(writer.segments().is_empty());
        assert!(store.segment_names().is_empty());
        assert_eq!(writer.pending_num_docs(), 0);
    }

    #[test]
    fn test_serial_merge() {
        let config = IndexWriterConfig::new().with_merge_scheduler(MergeSchedulerKind::Serial);
        let (writer, store) = writer(config);
        for i in 0..3 {
            writer.add_document(&doc(&i.to_string(), "merge me")).unwrap();
            writer.flush_all_threads().unwrap();
        }
        writer.delete_terms([Term::new("id", "1")]).unwrap();
        let target = writer.force_merge().unwrap().unwrap();

        assert_eq!(store.segment_names(), vec![target.clone()]);
        assert_eq!(writer.segments()[0].name, target);
        assert_eq!(writer.pending_num_docs(), 2);
        let reader = writer.open_reader().unwrap();
        assert_eq!(reader.max_doc(), 2);
        assert_eq!(reader.num_docs(), 2);
    }

    #[test]
    fn test_no_merge_scheduler_keeps_merge_pending() {
        let (writer, _store) = writer(IndexWriterConfig::new());
        writer.add_document(&doc("1", "a")).unwrap();
        writer.flush_all_threads().unwrap();
        writer.add_document(&doc("2", "b")).unwrap();
        writer.flush_all_threads().unwrap();
        writer.force_merge().unwrap();
        assert!(writer.has_pending_merges());
        let name = writer.segments()[0].name.clone();
        assert!(writer.request_merge(&[name.as_str()]).is_err());
    }

    #[test]
    fn test_rejected_document_is_not_counted() {
        let (writer, _store) = writer(IndexWriterConfig::new());
        let bad = Document::builder()
            .add_numeric("rank", 1)
            .add_numeric("rank", 2)
            .build();
        assert!(writer.add_document(&bad).is_err());
        assert_eq!(writer.pending_num_docs(), 0);
        writer.add_document(&doc("1", "ok")).unwrap();
        assert_eq!(writer.pending_num_docs(), 1);
    }

    #[test]
    fn test_close_flushes_and_rejects() {
        let (writer, store) = writer(IndexWriterConfig::new());
        writer.add_document(&doc("1", "a")).unwrap();
        writer.close().unwrap();
        assert_eq!(store.segment_names().len(), 1);
        assert!(writer.add_document(&doc("2", "b")).is_err());
        assert!(writer.open_reader().is_err());
        writer.close().unwrap();
    }

    #[test]
    fn test_rollback_discards_buffered_docs() {
        let (writer, store) = writer(IndexWriterConfig::new());
        writer.add_document(&doc("1", "a")).unwrap();
        writer.delete_terms([Term::new("id", "9")]).unwrap();
        writer.rollback().unwrap();
        assert!(store.segment_names().is_empty());
        assert_eq!(writer.pending_num_docs(), 0);
        assert!(!writer.updates().any());
        assert!(writer.add_document(&doc("2", "b")).is_err());
    }

    #[test]
    fn test_writer_resumes_numbering_over_existing_store() {
        let store = MemorySegmentStore::new();
        {
            let writer = DocumentsWriter::new(IndexWriterConfig::new(), Arc::new(store.clone())).unwrap();
            writer.add_document(&doc("1", "a")).unwrap();
            writer.close().unwrap();
        }
        let writer = DocumentsWriter::new(IndexWriterConfig::new(), Arc::new(store.clone())).unwrap();
        assert_eq!(writer.pending_num_docs(), 1);
        writer.add_document(&doc("2", "b")).unwrap();
        writer.close().unwrap();
        assert_eq!(store.segment_names(), vec!["_0".to_string(), "_1".to_string()]);
    }
}
