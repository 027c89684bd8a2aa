//! Flushed segments kept in memory.
//!
//! [`MemorySegmentSink`] assembles a [`SegmentData`] from what a flush hands
//! it and publishes it into a [`MemorySegmentStore`] on `finish`. Segments
//! are immutable once published: deletes and doc-value updates replace the
//! stored `Arc` with a modified copy, so readers opened earlier keep their
//! point-in-time view.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use bit_vec::BitVec;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::document::{DocId, StoredValue, Term};
use crate::error::{IrisError, Result};
use crate::index::field_infos::FieldInfo;
use crate::index::sink::{
    DocPosting, SegmentStore, SegmentSummary, SegmentWriteSink, TermPostings,
};
use crate::index::updates::SegmentUpdates;
use crate::reader::composite::{BaseCompositeReader, IndexReaderRef};
use crate::reader::leaf::{DocumentStoredFieldVisitor, LeafReader};
use crate::reader::memory::MemoryLeafReader;
use crate::util::merge_iter::MergeIterator;

/// Everything a segment knows about one field.
#[derive(Debug, Clone)]
pub struct FieldData {
    pub info: FieldInfo,
    /// Sorted by term bytes.
    pub postings: Vec<TermPostings>,
    pub norms: Option<Vec<Option<i64>>>,
    pub numeric: Option<Vec<Option<i64>>>,
    pub binary: Option<Vec<Option<Vec<u8>>>>,
}

impl FieldData {
    pub fn new(info: FieldInfo) -> Self {
        FieldData {
            info,
            postings: Vec::new(),
            norms: None,
            numeric: None,
            binary: None,
        }
    }

    pub fn term(&self, bytes: &[u8]) -> Option<&TermPostings> {
        self.postings
            .binary_search_by(|p| p.term.as_slice().cmp(bytes))
            .ok()
            .map(|i| &self.postings[i])
    }
}

/// An immutable in-memory segment.
#[derive(Debug, Clone)]
pub struct SegmentData {
    name: String,
    max_doc: DocId,
    fields: BTreeMap<String, FieldData>,
    stored: Vec<Vec<(String, StoredValue)>>,
    deleted: BitVec,
}

impl SegmentData {
    pub fn new<S: Into<String>>(name: S, max_doc: DocId) -> Self {
        SegmentData {
            name: name.into(),
            max_doc,
            fields: BTreeMap::new(),
            stored: vec![Vec::new(); max_doc as usize],
            deleted: BitVec::from_elem(max_doc as usize, false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_doc(&self) -> DocId {
        self.max_doc
    }

    pub fn del_count(&self) -> DocId {
        self.deleted.iter().filter(|&d| d).count() as DocId
    }

    pub fn num_docs(&self) -> DocId {
        self.max_doc - self.del_count()
    }

    pub fn is_deleted(&self, doc: DocId) -> bool {
        self.deleted.get(doc as usize).unwrap_or(false)
    }

    pub fn field(&self, name: &str) -> Option<&FieldData> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldData> {
        self.fields.values()
    }

    pub fn postings(&self, term: &Term) -> Option<&TermPostings> {
        self.fields.get(&term.field)?.term(&term.bytes)
    }

    pub fn stored(&self, doc: DocId) -> &[(String, StoredValue)] {
        self.stored.get(doc as usize).map_or(&[], Vec::as_slice)
    }

    fn field_mut(&mut self, info: &FieldInfo) -> &mut FieldData {
        self.fields
            .entry(info.name.clone())
            .or_insert_with(|| FieldData::new(info.clone()))
    }

    /// Mark a document deleted. Returns whether it was live.
    fn delete(&mut self, doc: DocId) -> bool {
        let doc = doc as usize;
        if doc >= self.deleted.len() || self.deleted[doc] {
            return false;
        }
        self.deleted.set(doc, true);
        true
    }

    /// Merge `segments` into one segment named `name`. Deleted documents are
    /// dropped; the survivors keep their relative order.
    pub fn merge(name: &str, segments: &[Arc<SegmentData>]) -> Result<SegmentData> {
        let leaves: Vec<IndexReaderRef> = segments
            .iter()
            .map(|s| {
                let leaf: Arc<dyn LeafReader> = Arc::new(MemoryLeafReader::new(s.clone()));
                IndexReaderRef::Leaf(leaf)
            })
            .collect();
        let composite = BaseCompositeReader::with_close_sub_readers(leaves)?;

        // old global id -> new id
        let mut doc_map: Vec<Option<DocId>> = Vec::with_capacity(composite.max_doc() as usize);
        let mut next: DocId = 0;
        for global in 0..composite.max_doc() {
            let (index, local) = composite.locate(global)?;
            if segments[index].is_deleted(local) {
                doc_map.push(None);
            } else {
                doc_map.push(Some(next));
                next += 1;
            }
        }

        let mut merged = SegmentData::new(name, next);
        for global in 0..composite.max_doc() {
            if let Some(new_doc) = doc_map[global as usize] {
                let mut visitor = DocumentStoredFieldVisitor::new();
                composite.visit_stored_fields(global, &mut visitor)?;
                merged.stored[new_doc as usize] = visitor.into_fields();
            }
        }

        let mut field_names: Vec<&String> = segments.iter().flat_map(|s| s.fields.keys()).collect();
        field_names.sort();
        field_names.dedup();

        for field_name in field_names {
            let mut info: Option<FieldInfo> = None;
            for segment in segments {
                if let Some(data) = segment.field(field_name) {
                    info = Some(merge_field_info(info, &data.info)?);
                }
            }
            let Some(info) = info else { continue };
            let field = merged.field_mut(&info);

            let runs = segments.iter().enumerate().filter_map(|(seg, s)| {
                s.field(field_name).map(move |data| {
                    data.postings
                        .iter()
                        .enumerate()
                        .map(move |(i, p)| (p.term.as_slice(), seg, i))
                })
            });
            let mut current: Option<TermPostings> = None;
            for (term, seg, i) in MergeIterator::new(runs) {
                let base = composite.reader_base(seg)?;
                let source = &segments[seg].fields[field_name].postings[i];
                if current.as_ref().is_some_and(|c| c.term.as_slice() != term) {
                    push_postings(&mut field.postings, current.take());
                }
                let target = current.get_or_insert_with(|| TermPostings {
                    term: term.to_vec(),
                    docs: Vec::new(),
                });
                for posting in &source.docs {
                    if let Some(doc) = doc_map[(base + posting.doc) as usize] {
                        target.docs.push(DocPosting {
                            doc,
                            ..posting.clone()
                        });
                    }
                }
            }
            push_postings(&mut field.postings, current.take());

            let columns = ColumnRemap {
                segments,
                composite: &composite,
                doc_map: &doc_map,
                field: field_name,
                max_doc: next as usize,
            };
            field.norms = columns.remap(|d| d.norms.as_ref())?;
            field.numeric = columns.remap(|d| d.numeric.as_ref())?;
            field.binary = columns.remap(|d| d.binary.as_ref())?;
        }

        composite.close()?;
        info!(
            "merged {} segments into {name} with {next} documents",
            segments.len()
        );
        Ok(merged)
    }
}

/// Copies one per-document column of every source segment into merged doc
/// id space.
struct ColumnRemap<'a> {
    segments: &'a [Arc<SegmentData>],
    composite: &'a BaseCompositeReader,
    doc_map: &'a [Option<DocId>],
    field: &'a str,
    max_doc: usize,
}

impl ColumnRemap<'_> {
    fn remap<T, F>(&self, column: F) -> Result<Option<Vec<Option<T>>>>
    where
        T: Clone,
        F: Fn(&FieldData) -> Option<&Vec<Option<T>>>,
    {
        let mut out: Option<Vec<Option<T>>> = None;
        for (seg, segment) in self.segments.iter().enumerate() {
            let Some(values) = segment.field(self.field).and_then(&column) else {
                continue;
            };
            let base = self.composite.reader_base(seg)? as usize;
            let out = out.get_or_insert_with(|| vec![None; self.max_doc]);
            for (local, value) in values.iter().enumerate() {
                if let Some(doc) = self.doc_map[base + local] {
                    out[doc as usize] = value.clone();
                }
            }
        }
        Ok(out)
    }
}

fn push_postings(postings: &mut Vec<TermPostings>, term: Option<TermPostings>) {
    if let Some(term) = term {
        if !term.docs.is_empty() {
            postings.push(term);
        }
    }
}

fn merge_field_info(current: Option<FieldInfo>, incoming: &FieldInfo) -> Result<FieldInfo> {
    let Some(mut info) = current else {
        return Ok(incoming.clone());
    };
    match (info.index_options, incoming.index_options) {
        (Some(a), Some(b)) if a != b => {
            return Err(IrisError::invalid_argument(format!(
                "field \"{}\" has index options {a:?} and {b:?} in different segments",
                info.name
            )));
        }
        (None, Some(b)) => info.index_options = Some(b),
        _ => {}
    }
    match (info.doc_values, incoming.doc_values) {
        (Some(a), Some(b)) if a != b => {
            return Err(IrisError::invalid_argument(format!(
                "field \"{}\" has doc values {a:?} and {b:?} in different segments",
                info.name
            )));
        }
        (None, Some(b)) => info.doc_values = Some(b),
        _ => {}
    }
    info.omit_norms |= incoming.omit_norms;
    Ok(info)
}

/// Assembles a [`SegmentData`] during a flush.
pub struct MemorySegmentSink {
    name: String,
    store: Arc<Mutex<Vec<Arc<SegmentData>>>>,
    fields: BTreeMap<String, FieldData>,
    stored: Vec<Vec<(String, StoredValue)>>,
    finished: bool,
}

impl MemorySegmentSink {
    fn field_mut(&mut self, info: &FieldInfo) -> &mut FieldData {
        self.fields
            .entry(info.name.clone())
            .or_insert_with(|| FieldData::new(info.clone()))
    }
}

impl SegmentWriteSink for MemorySegmentSink {
    fn write_postings(
        &mut self,
        field: &FieldInfo,
        postings: &mut dyn Iterator<Item = Result<TermPostings>>,
    ) -> Result<()> {
        let mut collected = Vec::new();
        let mut last: Option<Vec<u8>> = None;
        for term in postings {
            let term = term?;
            if last.as_ref().is_some_and(|l| *l >= term.term) {
                return Err(IrisError::index(format!(
                    "terms of field \"{}\" are not in increasing order",
                    field.name
                )));
            }
            last = Some(term.term.clone());
            collected.push(term);
        }
        self.field_mut(field).postings = collected;
        Ok(())
    }

    fn write_norms(
        &mut self,
        field: &FieldInfo,
        values: &mut dyn Iterator<Item = Option<i64>>,
    ) -> Result<()> {
        let values = values.collect();
        self.field_mut(field).norms = Some(values);
        Ok(())
    }

    fn write_numeric(
        &mut self,
        field: &FieldInfo,
        values: &mut dyn Iterator<Item = Option<i64>>,
    ) -> Result<()> {
        let values = values.collect();
        self.field_mut(field).numeric = Some(values);
        Ok(())
    }

    fn write_binary(
        &mut self,
        field: &FieldInfo,
        values: &mut dyn Iterator<Item = Option<Vec<u8>>>,
    ) -> Result<()> {
        let values = values.collect();
        self.field_mut(field).binary = Some(values);
        Ok(())
    }

    fn write_stored(
        &mut self,
        documents: &mut dyn Iterator<Item = Vec<(String, StoredValue)>>,
    ) -> Result<()> {
        self.stored = documents.collect();
        Ok(())
    }

    fn finish(&mut self, summary: &SegmentSummary) -> Result<()> {
        let max_doc = summary.max_doc as usize;
        if self.stored.len() > max_doc {
            return Err(IrisError::index(format!(
                "segment {} has stored fields for {} documents but max_doc {max_doc}",
                self.name,
                self.stored.len()
            )));
        }
        for data in self.fields.values() {
            let lengths = [
                data.norms.as_ref().map(Vec::len),
                data.numeric.as_ref().map(Vec::len),
                data.binary.as_ref().map(Vec::len),
            ];
            if lengths.into_iter().flatten().any(|len| len != max_doc) {
                return Err(IrisError::index(format!(
                    "field \"{}\" of segment {} does not cover {max_doc} documents",
                    data.info.name, self.name
                )));
            }
        }

        let mut segment = SegmentData::new(summary.name.clone(), summary.max_doc);
        segment.fields = std::mem::take(&mut self.fields);
        let stored = std::mem::take(&mut self.stored);
        for (doc, fields) in stored.into_iter().enumerate() {
            segment.stored[doc] = fields;
        }
        segment.deleted = summary.deleted.clone();
        segment.deleted.grow(max_doc.saturating_sub(segment.deleted.len()), false);

        self.store.lock().push(Arc::new(segment));
        self.finished = true;
        debug!("published segment {}", self.name);
        Ok(())
    }

    fn abort(&mut self) {
        if self.finished {
            warn!("abort after finish of segment {}", self.name);
            return;
        }
        self.fields.clear();
        self.stored.clear();
        debug!("discarded partial segment {}", self.name);
    }
}

/// Holds published segments in flush order.
#[derive(Debug, Default, Clone)]
pub struct MemorySegmentStore {
    segments: Arc<Mutex<Vec<Arc<SegmentData>>>>,
}

impl MemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn segment(&self, name: &str) -> Option<Arc<SegmentData>> {
        self.segments
            .lock()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    fn not_found(name: &str) -> IrisError {
        IrisError::invalid_argument(format!("segment {name} does not exist"))
    }
}

#[derive(Debug, Default)]
struct ResolvedUpdates {
    deletes: Vec<DocId>,
    numeric: Vec<(String, DocId, Option<i64>)>,
    binary: Vec<(String, DocId, Option<Vec<u8>>)>,
}

fn resolve_updates(reader: &dyn LeafReader, updates: SegmentUpdates<'_>) -> Result<ResolvedUpdates> {
    let mut resolved = ResolvedUpdates::default();
    for (term, limit) in updates.terms {
        let docs = reader.docs_with_term(term)?;
        resolved
            .deletes
            .extend(docs.into_iter().take_while(|&d| d < limit));
    }
    for (query, limit) in updates.queries {
        let docs = query.matching_docs(reader)?;
        resolved
            .deletes
            .extend(docs.into_iter().filter(|&d| d < limit));
    }
    for update in updates.numeric {
        for doc in reader.docs_with_term(&update.term)? {
            if doc < update.doc_id_upto {
                resolved.numeric.push((update.field.clone(), doc, update.value));
            }
        }
    }
    for update in updates.binary {
        for doc in reader.docs_with_term(&update.term)? {
            if doc < update.doc_id_upto {
                resolved
                    .binary
                    .push((update.field.clone(), doc, update.value.clone()));
            }
        }
    }
    Ok(resolved)
}

impl SegmentStore for MemorySegmentStore {
    fn create_sink(&self, segment: &str) -> Result<Box<dyn SegmentWriteSink>> {
        if self.segment(segment).is_some() {
            return Err(IrisError::invalid_argument(format!(
                "segment {segment} already exists"
            )));
        }
        Ok(Box::new(MemorySegmentSink {
            name: segment.to_string(),
            store: self.segments.clone(),
            fields: BTreeMap::new(),
            stored: Vec::new(),
            finished: false,
        }))
    }

    fn open_leaf(&self, segment: &str) -> Result<Arc<dyn LeafReader>> {
        let data = self.segment(segment).ok_or_else(|| Self::not_found(segment))?;
        Ok(Arc::new(MemoryLeafReader::new(data)))
    }

    fn apply_updates(&self, segment: &str, updates: SegmentUpdates<'_>) -> Result<u64> {
        let mut segments = self.segments.lock();
        let slot = segments
            .iter_mut()
            .find(|s| s.name() == segment)
            .ok_or_else(|| Self::not_found(segment))?;

        let resolved = {
            let reader = MemoryLeafReader::new(slot.clone());
            resolve_updates(&reader, updates)?
        };
        if resolved.deletes.is_empty() && resolved.numeric.is_empty() && resolved.binary.is_empty() {
            return Ok(0);
        }

        let data = Arc::make_mut(slot);
        let mut newly_deleted = 0;
        for doc in resolved.deletes {
            if data.delete(doc) {
                newly_deleted += 1;
            }
        }
        let mut skipped: AHashMap<String, usize> = AHashMap::new();
        for (field, doc, value) in resolved.numeric {
            match data.fields.get_mut(&field) {
                Some(FieldData {
                    numeric: Some(column),
                    ..
                }) => column[doc as usize] = value,
                _ => *skipped.entry(field).or_default() += 1,
            }
        }
        for (field, doc, value) in resolved.binary {
            match data.fields.get_mut(&field) {
                Some(FieldData {
                    binary: Some(column),
                    ..
                }) => column[doc as usize] = value,
                _ => *skipped.entry(field).or_default() += 1,
            }
        }
        for (field, count) in skipped {
            debug!("segment {segment} has no doc values column {field}; skipped {count} updates");
        }
        Ok(newly_deleted)
    }

    fn merge(&self, sources: &[String], target: &str) -> Result<DocId> {
        let inputs: Vec<Arc<SegmentData>> = sources
            .iter()
            .map(|name| self.segment(name).ok_or_else(|| Self::not_found(name)))
            .collect::<Result<_>>()?;
        let merged = Arc::new(SegmentData::merge(target, &inputs)?);
        let num_docs = merged.num_docs();

        let mut segments = self.segments.lock();
        let position = segments
            .iter()
            .position(|s| sources.iter().any(|n| n == s.name()))
            .unwrap_or(segments.len());
        segments.retain(|s| !sources.iter().any(|n| n == s.name()));
        let position = position.min(segments.len());
        segments.insert(position, merged);
        Ok(num_docs)
    }

    fn drop_segment(&self, segment: &str) -> Result<()> {
        let mut segments = self.segments.lock();
        let before = segments.len();
        segments.retain(|s| s.name() != segment);
        if segments.len() == before {
            return Err(Self::not_found(segment));
        }
        Ok(())
    }

    fn segment_names(&self) -> Vec<String> {
        self.segments
            .lock()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }
}
