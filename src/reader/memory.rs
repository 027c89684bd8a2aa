//! Leaf reader over an in-memory segment.

use std::sync::Arc;

use crate::document::{DocId, Term};
use crate::error::{IrisError, Result};
use crate::index::segment::SegmentData;
use crate::reader::leaf::{
    LeafReader, StoredFieldVisitor, TermVectorEntry, TermVectors, VisitStatus,
};
use crate::reader::registry::{ReaderCore, ReaderId};

/// Point-in-time reader over a published [`SegmentData`].
#[derive(Debug)]
pub struct MemoryLeafReader {
    core: ReaderCore,
    segment: Arc<SegmentData>,
}

impl MemoryLeafReader {
    pub fn new(segment: Arc<SegmentData>) -> Self {
        MemoryLeafReader {
            core: ReaderCore::new(),
            segment,
        }
    }

    pub fn segment(&self) -> &Arc<SegmentData> {
        &self.segment
    }

    pub fn core(&self) -> &ReaderCore {
        &self.core
    }

    pub fn is_deleted(&self, doc: DocId) -> bool {
        self.segment.is_deleted(doc)
    }

    pub fn norm(&self, field: &str, doc: DocId) -> Option<i64> {
        self.segment
            .field(field)?
            .norms
            .as_ref()?
            .get(doc as usize)
            .copied()
            .flatten()
    }

    pub fn numeric_value(&self, field: &str, doc: DocId) -> Option<i64> {
        self.segment
            .field(field)?
            .numeric
            .as_ref()?
            .get(doc as usize)
            .copied()
            .flatten()
    }

    pub fn binary_value(&self, field: &str, doc: DocId) -> Option<&[u8]> {
        self.segment
            .field(field)?
            .binary
            .as_ref()?
            .get(doc as usize)?
            .as_deref()
    }

    fn check_doc(&self, doc: DocId) -> Result<()> {
        if doc < 0 || doc >= self.segment.max_doc() {
            return Err(IrisError::out_of_range(format!(
                "doc id {doc} is outside 0..{} of segment {}",
                self.segment.max_doc(),
                self.segment.name()
            )));
        }
        Ok(())
    }
}

impl LeafReader for MemoryLeafReader {
    fn reader_id(&self) -> ReaderId {
        self.core.id()
    }

    fn max_doc(&self) -> DocId {
        self.segment.max_doc()
    }

    fn num_docs(&self) -> DocId {
        self.segment.num_docs()
    }

    fn term_vectors(&self, doc: DocId) -> Result<Option<TermVectors>> {
        self.check_doc(doc)?;
        let mut vectors = TermVectors::new();
        for field in self.segment.fields() {
            let entries: Vec<TermVectorEntry> = field
                .postings
                .iter()
                .filter_map(|p| {
                    let i = p.docs.binary_search_by_key(&doc, |d| d.doc).ok()?;
                    Some(TermVectorEntry {
                        term: p.term.clone(),
                        freq: p.docs[i].freq,
                        positions: p.docs[i].positions.clone(),
                    })
                })
                .collect();
            if !entries.is_empty() {
                vectors.insert(field.info.name.clone(), entries);
            }
        }
        Ok((!vectors.is_empty()).then_some(vectors))
    }

    fn visit_stored_fields(
        &self,
        doc: DocId,
        visitor: &mut dyn StoredFieldVisitor,
    ) -> Result<()> {
        self.check_doc(doc)?;
        for (name, value) in self.segment.stored(doc) {
            match visitor.needs_field(name) {
                VisitStatus::Yes => visitor.stored_field(name, value)?,
                VisitStatus::No => {}
                VisitStatus::Stop => break,
            }
        }
        Ok(())
    }

    fn doc_freq(&self, term: &Term) -> Result<Option<u64>> {
        self.core.ensure_open()?;
        Ok(Some(self.segment.postings(term).map_or(0, |p| p.doc_freq())))
    }

    fn total_term_freq(&self, term: &Term) -> Result<Option<u64>> {
        self.core.ensure_open()?;
        let Some(field) = self.segment.field(&term.field) else {
            return Ok(Some(0));
        };
        if !field.info.index_options.is_some_and(|o| o.has_freqs()) {
            return Ok(None);
        }
        Ok(Some(field.term(&term.bytes).map_or(0, |p| p.total_term_freq())))
    }

    fn sum_doc_freq(&self, field: &str) -> Result<Option<u64>> {
        self.core.ensure_open()?;
        Ok(Some(self.segment.field(field).map_or(0, |f| {
            f.postings.iter().map(|p| p.doc_freq()).sum()
        })))
    }

    fn doc_count(&self, field: &str) -> Result<Option<u64>> {
        self.core.ensure_open()?;
        let Some(field) = self.segment.field(field) else {
            return Ok(Some(0));
        };
        let mut docs: Vec<DocId> = field
            .postings
            .iter()
            .flat_map(|p| p.docs.iter().map(|d| d.doc))
            .collect();
        docs.sort_unstable();
        docs.dedup();
        Ok(Some(docs.len() as u64))
    }

    fn sum_total_term_freq(&self, field: &str) -> Result<Option<u64>> {
        self.core.ensure_open()?;
        let Some(field) = self.segment.field(field) else {
            return Ok(Some(0));
        };
        if !field.info.index_options.is_some_and(|o| o.has_freqs()) {
            return Ok(None);
        }
        Ok(Some(field.postings.iter().map(|p| p.total_term_freq()).sum()))
    }

    fn docs_with_term(&self, term: &Term) -> Result<Vec<DocId>> {
        Ok(self
            .segment
            .postings(term)
            .map(|p| p.docs.iter().map(|d| d.doc).collect())
            .unwrap_or_default())
    }

    fn register_parent_reader(&self, parent: ReaderId) {
        self.core.register_parent(parent);
    }

    fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}
