//! The per-thread document buffer.
//!
//! A [`DocumentsWriterPerThread`] buffers the documents of one thread state
//! until it is flushed into a new segment. Deletes and updates reach it
//! through the shared [`BufferedUpdatesStream`]: after every indexed document
//! and once more at flush it pulls the packets it has not seen yet and bounds
//! them by the document's id, so a delete never touches documents indexed
//! after it.

use std::sync::Arc;

use bit_vec::BitVec;
use log::{debug, info, warn};

use crate::document::{DocId, Document, MAX_DOCS, Term};
use crate::error::{IrisError, Result};
use crate::index::chain::IndexingChain;
use crate::index::sink::{SegmentStore, SegmentSummary};
use crate::index::thread_pool::PerThreadBuffer;
use crate::index::updates::{BufferedUpdates, BufferedUpdatesStream, FrozenBufferedUpdates};

/// Result of a successful flush.
#[derive(Debug)]
pub struct FlushedSegment {
    pub name: String,
    pub max_doc: DocId,
    /// Documents deleted by buffered term deletes during the flush.
    pub del_count: usize,
    /// Generation of the newest packet the segment has absorbed.
    pub del_gen: u64,
    /// Query deletes and doc-value updates that still have to be applied to
    /// the published segment.
    pub private_updates: Option<FrozenBufferedUpdates>,
}

pub struct DocumentsWriterPerThread {
    segment_name: String,
    chain: IndexingChain,
    num_docs: DocId,
    pending_updates: BufferedUpdates,
    updates: Arc<BufferedUpdatesStream>,
    seen_gen: u64,
    aborted: bool,
}

impl std::fmt::Debug for DocumentsWriterPerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentsWriterPerThread")
            .field("segment", &self.segment_name)
            .field("num_docs", &self.num_docs)
            .field("seen_gen", &self.seen_gen)
            .field("aborted", &self.aborted)
            .finish()
    }
}

impl DocumentsWriterPerThread {
    pub fn new<S: Into<String>>(segment_name: S, updates: Arc<BufferedUpdatesStream>) -> Self {
        let seen_gen = updates.subscribe();
        let segment_name = segment_name.into();
        debug!("new per-thread writer for segment {segment_name} at gen {seen_gen}");
        DocumentsWriterPerThread {
            segment_name,
            chain: IndexingChain::new(),
            num_docs: 0,
            pending_updates: BufferedUpdates::new(),
            updates,
            seen_gen,
            aborted: false,
        }
    }

    pub fn chain(&self) -> &IndexingChain {
        &self.chain
    }

    pub fn pending_updates(&self) -> &BufferedUpdates {
        &self.pending_updates
    }

    pub fn seen_gen(&self) -> u64 {
        self.seen_gen
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    fn pull_updates(&mut self) {
        let (packets, newest) = self.updates.pull(self.seen_gen);
        for packet in &packets {
            self.pending_updates.absorb(packet, self.num_docs);
        }
        self.seen_gen = newest;
    }

    /// Buffer `doc`. With `del_term`, every document containing the term
    /// that was indexed before this one, in this buffer or anywhere else, is
    /// deleted.
    ///
    /// A document that fails validation is rejected and nothing changes. A
    /// failure after the document reached the indexing chain aborts the
    /// whole buffer.
    pub fn update_document(&mut self, doc: &Document, del_term: Option<Term>) -> Result<()> {
        self.index_document(doc)?;
        self.finish_document(del_term);
        Ok(())
    }

    fn index_document(&mut self, doc: &Document) -> Result<()> {
        if self.aborted {
            return Err(IrisError::aborted(format!(
                "writer for segment {} was aborted",
                self.segment_name
            )));
        }
        if self.num_docs >= MAX_DOCS {
            return Err(IrisError::capacity(format!(
                "segment {} cannot hold more than {MAX_DOCS} documents",
                self.segment_name
            )));
        }
        self.chain.validate(self.num_docs, doc)?;

        if let Err(e) = self.chain.process_document(self.num_docs, doc) {
            warn!(
                "aborting segment {} after a failed document: {e}",
                self.segment_name
            );
            if let Err(abort_error) = self.abort() {
                warn!("abort of segment {} failed: {abort_error}", self.segment_name);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Publish the document's delete term and absorb what arrived up to it,
    /// bounded by the document's own id. The term is pushed only once the
    /// document is indexed, so of two racing updates the one pushed last
    /// keeps its document.
    fn finish_document(&mut self, del_term: Option<Term>) {
        let (packets, newest) = match del_term {
            Some(term) => self
                .updates
                .push_and_pull(self.seen_gen, FrozenBufferedUpdates::from_terms([term])),
            None => self.updates.pull(self.seen_gen),
        };
        for packet in &packets {
            self.pending_updates.absorb(packet, self.num_docs);
        }
        self.seen_gen = newest;
        self.num_docs += 1;
    }

    /// Write the buffer as a new segment into `store`.
    ///
    /// On failure the partially written segment and the buffer are discarded
    /// and the original error is returned.
    pub fn flush(&mut self, store: &dyn SegmentStore) -> Result<FlushedSegment> {
        if self.aborted {
            return Err(IrisError::aborted(format!(
                "writer for segment {} was aborted",
                self.segment_name
            )));
        }
        debug_assert!(self.num_docs > 0);
        self.pull_updates();

        let max_doc = self.num_docs;
        let mut deleted = BitVec::from_elem(max_doc as usize, false);
        let mut sink = store.create_sink(&self.segment_name)?;

        let result = self
            .chain
            .flush(
                &self.segment_name,
                max_doc,
                sink.as_mut(),
                &self.pending_updates,
                &mut deleted,
            )
            .and_then(|()| {
                let summary = SegmentSummary {
                    name: self.segment_name.clone(),
                    max_doc,
                    deleted,
                };
                sink.finish(&summary).map(|()| summary.del_count())
            });

        if result.is_err() {
            sink.abort();
            if let Err(abort_error) = self.abort() {
                warn!("abort of segment {} failed: {abort_error}", self.segment_name);
            }
        }
        let del_count = result?;

        self.pending_updates.clear_terms();
        let private_updates = if self.pending_updates.any() {
            Some(self.pending_updates.freeze(true))
        } else {
            None
        };
        info!(
            "flushed segment {}: {max_doc} docs, {del_count} deleted while flushing",
            self.segment_name
        );
        self.num_docs = 0;
        Ok(FlushedSegment {
            name: self.segment_name.clone(),
            max_doc,
            del_count,
            del_gen: self.seen_gen,
            private_updates,
        })
    }

    /// Discard every buffered document and update. The writer cannot be
    /// used afterwards.
    pub fn abort(&mut self) -> Result<()> {
        self.aborted = true;
        warn!(
            "aborting segment {} with {} buffered docs",
            self.segment_name, self.num_docs
        );
        self.num_docs = 0;
        self.pending_updates.clear();
        self.chain.abort()
    }
}

impl PerThreadBuffer for DocumentsWriterPerThread {
    fn num_docs(&self) -> usize {
        self.num_docs as usize
    }

    fn bytes_used(&self) -> u64 {
        self.chain.bytes_used() + self.pending_updates.bytes_used() as u64
    }

    fn segment_name(&self) -> &str {
        &self.segment_name
    }
}

impl Drop for DocumentsWriterPerThread {
    fn drop(&mut self) {
        self.updates.unsubscribe(self.seen_gen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Field, StoredValue};
    use crate::index::segment::MemorySegmentStore;
    use crate::index::updates::{DeleteQuery, TermQuery};
    use crate::reader::LeafReader;

    fn doc(id: &str, body: &str) -> Document {
        Document::builder()
            .add_field(Field::keyword("id", id).store(StoredValue::Text(id.to_string())))
            .add_tokens("body", body.split_whitespace())
            .build()
    }

    #[test]
    fn test_update_deletes_only_earlier_docs() {
        let stream = Arc::new(BufferedUpdatesStream::new());
        let store = MemorySegmentStore::new();
        let mut dwpt = DocumentsWriterPerThread::new("_0", stream.clone());

        dwpt.update_document(&doc("1", "first version"), None).unwrap();
        dwpt.update_document(&doc("2", "other"), None).unwrap();
        dwpt.update_document(&doc("1", "second version"), Some(Term::new("id", "1")))
            .unwrap();
        assert_eq!(dwpt.num_docs(), 3);
        assert!(dwpt.bytes_used() > 0);

        let flushed = dwpt.flush(&store).unwrap();
        assert_eq!(flushed.max_doc, 3);
        assert_eq!(flushed.del_count, 1);
        assert_eq!(flushed.del_gen, 1);
        assert!(flushed.private_updates.is_none());

        let segment = store.segment("_0").unwrap();
        assert!(segment.is_deleted(0));
        assert!(!segment.is_deleted(2));
    }

    #[test]
    fn test_deletes_from_other_writers_are_bounded() {
        let stream = Arc::new(BufferedUpdatesStream::new());
        let store = MemorySegmentStore::new();
        let mut dwpt = DocumentsWriterPerThread::new("_0", stream.clone());
        dwpt.update_document(&doc("1", "quick"), None).unwrap();

        // a delete issued elsewhere between two documents of this writer
        stream.push(FrozenBufferedUpdates::from_terms([Term::new("body", "quick")]));
        dwpt.update_document(&doc("2", "quick"), None).unwrap();

        let query: Arc<dyn DeleteQuery> = Arc::new(TermQuery::new(Term::new("id", "2")));
        stream.push(FrozenBufferedUpdates::from_queries([query]));

        let flushed = dwpt.flush(&store).unwrap();
        assert_eq!(flushed.del_count, 1);
        assert_eq!(flushed.del_gen, 2);
        let private = flushed.private_updates.unwrap();
        assert!(private.is_segment_private());
        assert_eq!(private.queries().len(), 1);

        store
            .apply_updates("_0", private.as_segment_updates())
            .unwrap();
        let reader = store.open_leaf("_0").unwrap();
        assert_eq!(reader.num_docs(), 0);
    }

    #[test]
    fn test_racing_updates_keep_one_document() {
        let stream = Arc::new(BufferedUpdatesStream::new());
        let store = MemorySegmentStore::new();
        let mut first = DocumentsWriterPerThread::new("_0", stream.clone());
        let mut second = DocumentsWriterPerThread::new("_1", stream.clone());
        let id = Term::new("id", "1");

        // the second writer indexed its copy but has not published its delete yet
        second.index_document(&doc("1", "second")).unwrap();
        first
            .update_document(&doc("1", "first"), Some(id.clone()))
            .unwrap();
        second.finish_document(Some(id));

        first.flush(&store).unwrap();
        second.flush(&store).unwrap();
        // the delete pushed last wins
        assert_eq!(store.open_leaf("_0").unwrap().num_docs(), 0);
        assert_eq!(store.open_leaf("_1").unwrap().num_docs(), 1);
    }

    #[test]
    fn test_own_delete_skips_own_document() {
        let stream = Arc::new(BufferedUpdatesStream::new());
        let store = MemorySegmentStore::new();
        let mut dwpt = DocumentsWriterPerThread::new("_0", stream.clone());
        let id = Term::new("id", "1");
        dwpt.update_document(&doc("1", "a"), Some(id.clone())).unwrap();
        dwpt.update_document(&doc("1", "b"), Some(id)).unwrap();

        let flushed = dwpt.flush(&store).unwrap();
        assert_eq!(flushed.del_count, 1);
        let segment = store.segment("_0").unwrap();
        assert!(segment.is_deleted(0));
        assert!(!segment.is_deleted(1));
    }

    #[test]
    fn test_rejected_document_leaves_buffer_untouched() {
        let stream = Arc::new(BufferedUpdatesStream::new());
        let mut dwpt = DocumentsWriterPerThread::new("_0", stream.clone());
        dwpt.update_document(&doc("1", "quick"), None).unwrap();
        let bytes = dwpt.bytes_used();

        let bad = Document::builder()
            .add_numeric("rank", 1)
            .add_numeric("rank", 2)
            .build();
        assert!(dwpt.update_document(&bad, Some(Term::new("id", "1"))).is_err());
        assert_eq!(dwpt.num_docs(), 1);
        assert_eq!(dwpt.bytes_used(), bytes);
        // a rejected update does not delete either
        assert_eq!(stream.last_gen(), 0);
    }

    #[test]
    fn test_abort_and_unsubscribe() {
        let stream = Arc::new(BufferedUpdatesStream::new());
        let mut dwpt = DocumentsWriterPerThread::new("_0", stream.clone());
        dwpt.update_document(&doc("1", "quick"), None).unwrap();
        dwpt.abort().unwrap();
        assert_eq!(dwpt.num_docs(), 0);
        assert_eq!(dwpt.bytes_used(), 0);
        assert!(dwpt.update_document(&doc("2", "x"), None).is_err());

        stream.push(FrozenBufferedUpdates::from_terms([Term::new("id", "9")]));
        drop(dwpt);
        // nobody is left to see the packet
        stream.prune(u64::MAX);
        assert_eq!(stream.num_packets(), 0);
    }
}
