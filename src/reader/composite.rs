//! Many readers presented as one document-id space.
//!
//! [`BaseCompositeReader`] keeps a prefix-sum table `starts` of length `N + 1`
//! over its sub-readers: sub-reader `i` owns global ids
//! `starts[i]..starts[i + 1]`, and `starts[N]` is the composite's `max_doc`.
//! Empty sub-readers produce repeated entries in `starts`, and a global id
//! always resolves to the last sub-reader whose start is `<=` it.

use std::sync::{Arc, OnceLock};

use log::debug;

use crate::document::{DocId, MAX_DOCS, Term};
use crate::error::{IrisError, Result};
use crate::reader::context::{ReaderContext, build_composite_context};
use crate::reader::leaf::{LeafReader, StoredFieldVisitor, TermVectors};
use crate::reader::registry::{ReaderCore, ReaderId};

/// A sub-reader of a composite: either a segment or another composite.
#[derive(Debug, Clone)]
pub enum IndexReaderRef {
    Leaf(Arc<dyn LeafReader>),
    Composite(Arc<BaseCompositeReader>),
}

impl IndexReaderRef {
    pub fn id(&self) -> ReaderId {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.reader_id(),
            IndexReaderRef::Composite(composite) => composite.id(),
        }
    }

    pub fn max_doc(&self) -> DocId {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.max_doc(),
            IndexReaderRef::Composite(composite) => composite.max_doc(),
        }
    }

    pub fn num_docs(&self) -> DocId {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.num_docs(),
            IndexReaderRef::Composite(composite) => composite.num_docs(),
        }
    }

    pub fn term_vectors(&self, doc: DocId) -> Result<Option<TermVectors>> {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.term_vectors(doc),
            IndexReaderRef::Composite(composite) => composite.term_vectors(doc),
        }
    }

    pub fn visit_stored_fields(
        &self,
        doc: DocId,
        visitor: &mut dyn StoredFieldVisitor,
    ) -> Result<()> {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.visit_stored_fields(doc, visitor),
            IndexReaderRef::Composite(composite) => composite.visit_stored_fields(doc, visitor),
        }
    }

    pub fn doc_freq(&self, term: &Term) -> Result<Option<u64>> {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.doc_freq(term),
            IndexReaderRef::Composite(composite) => composite.doc_freq(term),
        }
    }

    pub fn total_term_freq(&self, term: &Term) -> Result<Option<u64>> {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.total_term_freq(term),
            IndexReaderRef::Composite(composite) => composite.total_term_freq(term),
        }
    }

    pub fn sum_doc_freq(&self, field: &str) -> Result<Option<u64>> {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.sum_doc_freq(field),
            IndexReaderRef::Composite(composite) => composite.sum_doc_freq(field),
        }
    }

    pub fn doc_count(&self, field: &str) -> Result<Option<u64>> {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.doc_count(field),
            IndexReaderRef::Composite(composite) => composite.doc_count(field),
        }
    }

    pub fn sum_total_term_freq(&self, field: &str) -> Result<Option<u64>> {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.sum_total_term_freq(field),
            IndexReaderRef::Composite(composite) => composite.sum_total_term_freq(field),
        }
    }

    pub fn register_parent_reader(&self, parent: ReaderId) {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.register_parent_reader(parent),
            IndexReaderRef::Composite(composite) => composite.core.register_parent(parent),
        }
    }

    pub fn close(&self) -> Result<()> {
        match self {
            IndexReaderRef::Leaf(leaf) => leaf.close(),
            IndexReaderRef::Composite(composite) => composite.close(),
        }
    }
}

impl From<Arc<dyn LeafReader>> for IndexReaderRef {
    fn from(leaf: Arc<dyn LeafReader>) -> Self {
        IndexReaderRef::Leaf(leaf)
    }
}

impl From<Arc<BaseCompositeReader>> for IndexReaderRef {
    fn from(composite: Arc<BaseCompositeReader>) -> Self {
        IndexReaderRef::Composite(composite)
    }
}

/// Where one sub-reader sits inside the composite's id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderSlice {
    pub start: DocId,
    pub length: DocId,
    pub reader_index: usize,
}

/// Aggregates sub-readers into one logical document space.
#[derive(Debug)]
pub struct BaseCompositeReader {
    core: ReaderCore,
    sub_readers: Vec<IndexReaderRef>,
    starts: Vec<DocId>,
    max_doc: DocId,
    num_docs: DocId,
    close_sub_readers: bool,
    context: OnceLock<ReaderContext>,
}

impl BaseCompositeReader {
    /// Wrap `sub_readers` without taking over closing them.
    pub fn new(sub_readers: Vec<IndexReaderRef>) -> Result<Arc<Self>> {
        Self::build(sub_readers, false)
    }

    /// Wrap `sub_readers`; closing the composite closes them too.
    pub fn with_close_sub_readers(sub_readers: Vec<IndexReaderRef>) -> Result<Arc<Self>> {
        Self::build(sub_readers, true)
    }

    fn build(sub_readers: Vec<IndexReaderRef>, close_sub_readers: bool) -> Result<Arc<Self>> {
        let mut starts = Vec::with_capacity(sub_readers.len() + 1);
        let mut max_doc: i64 = 0;
        let mut num_docs: i64 = 0;
        for sub in &sub_readers {
            starts.push(max_doc as DocId);
            max_doc += i64::from(sub.max_doc());
            if max_doc > i64::from(MAX_DOCS) {
                return Err(IrisError::capacity(format!(
                    "too many documents: composite readers cannot exceed {MAX_DOCS} but sub-readers sum to {max_doc}"
                )));
            }
            num_docs += i64::from(sub.num_docs());
        }
        starts.push(max_doc as DocId);

        let core = ReaderCore::new();
        for sub in &sub_readers {
            sub.register_parent_reader(core.id());
        }
        debug!(
            "{} wraps {} sub-readers, max_doc={max_doc}",
            core.id(),
            sub_readers.len()
        );

        Ok(Arc::new(BaseCompositeReader {
            core,
            sub_readers,
            starts,
            max_doc: max_doc as DocId,
            num_docs: num_docs as DocId,
            close_sub_readers,
            context: OnceLock::new(),
        }))
    }

    pub fn id(&self) -> ReaderId {
        self.core.id()
    }

    pub fn core(&self) -> &ReaderCore {
        &self.core
    }

    pub fn max_doc(&self) -> DocId {
        self.max_doc
    }

    pub fn num_docs(&self) -> DocId {
        self.num_docs
    }

    pub fn has_deletions(&self) -> bool {
        self.num_docs < self.max_doc
    }

    pub fn sub_readers(&self) -> &[IndexReaderRef] {
        &self.sub_readers
    }

    /// The prefix-sum table, `sub_readers().len() + 1` entries.
    pub fn starts(&self) -> &[DocId] {
        &self.starts
    }

    pub fn slices(&self) -> Vec<ReaderSlice> {
        self.starts
            .windows(2)
            .enumerate()
            .map(|(reader_index, pair)| ReaderSlice {
                start: pair[0],
                length: pair[1] - pair[0],
                reader_index,
            })
            .collect()
    }

    /// Index of the sub-reader that owns global id `doc`.
    pub fn reader_index(&self, doc: DocId) -> Result<usize> {
        if doc < 0 || doc >= self.max_doc {
            return Err(IrisError::out_of_range(format!(
                "doc id {doc} is outside 0..{}",
                self.max_doc
            )));
        }
        let n = self.sub_readers.len();
        // rightmost start <= doc; empty sub-readers share their start with
        // the next one and are skipped this way
        Ok(self.starts[..n].partition_point(|&start| start <= doc) - 1)
    }

    /// First global id of sub-reader `reader_index`.
    pub fn reader_base(&self, reader_index: usize) -> Result<DocId> {
        if reader_index >= self.sub_readers.len() {
            return Err(IrisError::out_of_range(format!(
                "sub-reader index {reader_index} is outside 0..{}",
                self.sub_readers.len()
            )));
        }
        Ok(self.starts[reader_index])
    }

    /// Resolve a global id to `(reader_index, local_id)`.
    pub fn locate(&self, doc: DocId) -> Result<(usize, DocId)> {
        let index = self.reader_index(doc)?;
        Ok((index, doc - self.starts[index]))
    }

    pub fn term_vectors(&self, doc: DocId) -> Result<Option<TermVectors>> {
        let (index, local) = self.locate(doc)?;
        self.sub_readers[index].term_vectors(local)
    }

    pub fn visit_stored_fields(
        &self,
        doc: DocId,
        visitor: &mut dyn StoredFieldVisitor,
    ) -> Result<()> {
        let (index, local) = self.locate(doc)?;
        self.sub_readers[index].visit_stored_fields(local, visitor)
    }

    fn sum_stat<F>(&self, mut stat: F) -> Result<Option<u64>>
    where
        F: FnMut(&IndexReaderRef) -> Result<Option<u64>>,
    {
        self.core.ensure_open()?;
        let mut total = 0u64;
        for sub in &self.sub_readers {
            match stat(sub)? {
                Some(value) => total += value,
                None => return Ok(None),
            }
        }
        Ok(Some(total))
    }

    pub fn doc_freq(&self, term: &Term) -> Result<Option<u64>> {
        self.sum_stat(|sub| sub.doc_freq(term))
    }

    pub fn total_term_freq(&self, term: &Term) -> Result<Option<u64>> {
        self.sum_stat(|sub| sub.total_term_freq(term))
    }

    pub fn sum_doc_freq(&self, field: &str) -> Result<Option<u64>> {
        self.sum_stat(|sub| sub.sum_doc_freq(field))
    }

    pub fn doc_count(&self, field: &str) -> Result<Option<u64>> {
        self.sum_stat(|sub| sub.doc_count(field))
    }

    pub fn sum_total_term_freq(&self, field: &str) -> Result<Option<u64>> {
        self.sum_stat(|sub| sub.sum_total_term_freq(field))
    }

    /// The top-level context tree, built on first use.
    pub fn context(&self) -> Result<&ReaderContext> {
        self.core.ensure_open()?;
        if let Some(context) = self.context.get() {
            return Ok(context);
        }
        let context = build_composite_context(self)?;
        // a concurrent builder may have won; both trees are identical
        let _ = self.context.set(context);
        self.context
            .get()
            .ok_or_else(|| IrisError::internal("reader context was not initialized"))
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn close(&self) -> Result<()> {
        if !self.core.close() {
            return Ok(());
        }
        if !self.close_sub_readers {
            return Ok(());
        }
        let mut first_error = None;
        for sub in &self.sub_readers {
            if let Err(e) = sub.close() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
