//! The boundary between the indexing core and whatever persists segments.
//!
//! A flush hands every finished field to a [`SegmentWriteSink`] as a lazy,
//! single-pass sequence. Per-document sequences are in increasing doc id
//! order and cover every document of the segment, with `None` for holes.
//! A [`SegmentStore`] creates sinks and gives access to finished segments.

use std::fmt;
use std::sync::Arc;

use bit_vec::BitVec;

use crate::document::{DocId, StoredValue};
use crate::error::Result;
use crate::index::field_infos::FieldInfo;
use crate::index::updates::SegmentUpdates;
use crate::reader::LeafReader;

/// One document's occurrences of a term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocPosting {
    pub doc: DocId,
    /// Always 1 when the field does not record frequencies.
    pub freq: u32,
    /// Empty when the field does not record positions.
    pub positions: Vec<u32>,
}

/// All postings of one term, documents in increasing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermPostings {
    pub term: Vec<u8>,
    pub docs: Vec<DocPosting>,
}

impl TermPostings {
    pub fn doc_freq(&self) -> u64 {
        self.docs.len() as u64
    }

    pub fn total_term_freq(&self) -> u64 {
        self.docs.iter().map(|d| u64::from(d.freq)).sum()
    }
}

/// Summary handed to [`SegmentWriteSink::finish`].
#[derive(Debug, Clone)]
pub struct SegmentSummary {
    pub name: String,
    pub max_doc: DocId,
    /// Documents deleted while the segment was still buffered.
    pub deleted: BitVec,
}

impl SegmentSummary {
    pub fn del_count(&self) -> usize {
        self.deleted.iter().filter(|&d| d).count()
    }
}

/// Receives the contents of one segment during a flush.
///
/// If any call fails, the flush calls [`abort`](Self::abort) and the sink must
/// discard everything it received.
pub trait SegmentWriteSink: Send {
    fn write_postings(
        &mut self,
        field: &FieldInfo,
        postings: &mut dyn Iterator<Item = Result<TermPostings>>,
    ) -> Result<()>;

    fn write_norms(
        &mut self,
        field: &FieldInfo,
        values: &mut dyn Iterator<Item = Option<i64>>,
    ) -> Result<()>;

    fn write_numeric(
        &mut self,
        field: &FieldInfo,
        values: &mut dyn Iterator<Item = Option<i64>>,
    ) -> Result<()>;

    fn write_binary(
        &mut self,
        field: &FieldInfo,
        values: &mut dyn Iterator<Item = Option<Vec<u8>>>,
    ) -> Result<()>;

    /// Stored fields of every document, in doc id order.
    fn write_stored(
        &mut self,
        documents: &mut dyn Iterator<Item = Vec<(String, StoredValue)>>,
    ) -> Result<()>;

    /// Make the segment visible.
    fn finish(&mut self, summary: &SegmentSummary) -> Result<()>;

    /// Discard everything written so far. Failures here are logged by the
    /// sink, never returned, so that the original error stays visible.
    fn abort(&mut self);
}

/// Where segments live once flushed.
pub trait SegmentStore: Send + Sync + fmt::Debug {
    fn create_sink(&self, segment: &str) -> Result<Box<dyn SegmentWriteSink>>;

    /// Open a point-in-time reader over a finished segment.
    fn open_leaf(&self, segment: &str) -> Result<Arc<dyn LeafReader>>;

    /// Apply deletes and doc-value updates to a finished segment. Returns the
    /// number of newly deleted documents.
    fn apply_updates(&self, segment: &str, updates: SegmentUpdates<'_>) -> Result<u64>;

    /// Merge `sources` into a new segment named `target` and drop the
    /// sources. Returns the live document count of the result.
    fn merge(&self, sources: &[String], target: &str) -> Result<DocId>;

    fn drop_segment(&self, segment: &str) -> Result<()>;

    fn segment_names(&self) -> Vec<String>;
}
