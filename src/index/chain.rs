//! The indexing chain.
//!
//! A document passes through a fixed, ordered list of [`FieldStage`]s. Every
//! stage implements [`FieldConsumer`]; the chain owns the segment's
//! [`FieldInfos`] and validates a document completely before any stage sees
//! it, so a rejected document leaves no trace in the buffer.
//!
//! # Stages
//!
//! 1. terms hash: inverted postings
//! 2. norms: per-field lengths
//! 3. doc values: numeric and binary per-document values
//! 4. stored fields

use std::fmt;

use ahash::AHashMap;
use bit_vec::BitVec;
use log::warn;

use crate::document::{DocId, Document, Field, FieldValue, IndexOptions};
use crate::error::{IrisError, Result};
use crate::index::doc_values::DocValuesWriter;
use crate::index::field_infos::{FieldInfo, FieldInfos};
use crate::index::norms::NormsWriter;
use crate::index::sink::SegmentWriteSink;
use crate::index::stored::StoredFieldsWriter;
use crate::index::terms_hash::TermsHash;
use crate::index::updates::BufferedUpdates;
use crate::pool::byte_block::MAX_TERM_LENGTH;
use crate::util::counter::Counter;

/// What a stage gets to see while its segment is flushed.
pub struct FlushContext<'a> {
    pub segment: &'a str,
    pub field_infos: &'a FieldInfos,
    pub max_doc: DocId,
    pub sink: &'a mut dyn SegmentWriteSink,
    /// Term deletes buffered against this segment; applied while postings
    /// are written.
    pub deletes: &'a BufferedUpdates,
    /// One bit per document, set for documents deleted during the flush.
    pub deleted: &'a mut BitVec,
}

/// One stage of the indexing chain.
pub trait FieldConsumer: fmt::Debug + Send {
    fn start_document(&mut self, _doc: DocId) {}

    fn process_field(&mut self, doc: DocId, info: &FieldInfo, field: &Field) -> Result<()>;

    fn finish_document(&mut self, _doc: DocId) -> Result<()> {
        Ok(())
    }

    /// Hand everything buffered to the sink and drop it.
    fn flush(&mut self, ctx: &mut FlushContext<'_>) -> Result<()>;

    /// Drop everything buffered.
    fn abort(&mut self) -> Result<()>;

    fn bytes_used(&self) -> u64;
}

#[derive(Debug)]
pub enum FieldStage {
    TermsHash(TermsHash),
    Norms(NormsWriter),
    DocValues(DocValuesWriter),
    StoredFields(StoredFieldsWriter),
}

impl FieldStage {
    pub fn name(&self) -> &'static str {
        match self {
            FieldStage::TermsHash(_) => "terms hash",
            FieldStage::Norms(_) => "norms",
            FieldStage::DocValues(_) => "doc values",
            FieldStage::StoredFields(_) => "stored fields",
        }
    }

    fn consumer(&self) -> &dyn FieldConsumer {
        match self {
            FieldStage::TermsHash(s) => s,
            FieldStage::Norms(s) => s,
            FieldStage::DocValues(s) => s,
            FieldStage::StoredFields(s) => s,
        }
    }

    fn consumer_mut(&mut self) -> &mut dyn FieldConsumer {
        match self {
            FieldStage::TermsHash(s) => s,
            FieldStage::Norms(s) => s,
            FieldStage::DocValues(s) => s,
            FieldStage::StoredFields(s) => s,
        }
    }
}

impl FieldConsumer for FieldStage {
    fn start_document(&mut self, doc: DocId) {
        self.consumer_mut().start_document(doc);
    }

    fn process_field(&mut self, doc: DocId, info: &FieldInfo, field: &Field) -> Result<()> {
        self.consumer_mut().process_field(doc, info, field)
    }

    fn finish_document(&mut self, doc: DocId) -> Result<()> {
        self.consumer_mut().finish_document(doc)
    }

    fn flush(&mut self, ctx: &mut FlushContext<'_>) -> Result<()> {
        self.consumer_mut().flush(ctx)
    }

    fn abort(&mut self) -> Result<()> {
        self.consumer_mut().abort()
    }

    fn bytes_used(&self) -> u64 {
        self.consumer().bytes_used()
    }
}

#[derive(Debug)]
pub struct IndexingChain {
    field_infos: FieldInfos,
    stages: Vec<FieldStage>,
}

impl Default for IndexingChain {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexingChain {
    pub fn new() -> Self {
        IndexingChain {
            field_infos: FieldInfos::new(),
            stages: vec![
                FieldStage::TermsHash(TermsHash::new(Counter::new())),
                FieldStage::Norms(NormsWriter::new(Counter::new())),
                FieldStage::DocValues(DocValuesWriter::new(Counter::new())),
                FieldStage::StoredFields(StoredFieldsWriter::new(Counter::new())),
            ],
        }
    }

    pub fn field_infos(&self) -> &FieldInfos {
        &self.field_infos
    }

    pub fn stages(&self) -> &[FieldStage] {
        &self.stages
    }

    pub fn terms_hash(&self) -> Option<&TermsHash> {
        self.stages.iter().find_map(|stage| match stage {
            FieldStage::TermsHash(terms) => Some(terms),
            _ => None,
        })
    }

    pub fn bytes_used(&self) -> u64 {
        self.stages.iter().map(FieldConsumer::bytes_used).sum()
    }

    /// Check everything that could make a stage reject `doc`.
    pub fn validate(&self, doc_id: DocId, doc: &Document) -> Result<()> {
        // (index options, has doc values) of the first instance in this doc
        let mut seen: AHashMap<&str, (Option<IndexOptions>, bool)> = AHashMap::new();
        let doc_values = self.stages.iter().find_map(|stage| match stage {
            FieldStage::DocValues(dv) => Some(dv),
            _ => None,
        });

        for field in doc.fields() {
            self.field_infos.check(field)?;

            let options = field.is_indexed().then_some(field.index_options);
            let is_doc_value = matches!(field.value, FieldValue::Numeric(_) | FieldValue::Binary(_));
            let first_instance = match seen.get(field.name.as_str()) {
                None => true,
                Some(&(prev_options, prev_doc_value)) => {
                    if let (Some(prev), Some(options)) = (prev_options, options) {
                        if prev != options {
                            return Err(IrisError::invalid_argument(format!(
                                "field \"{}\" uses index options {prev:?} and {options:?} in one document",
                                field.name
                            )));
                        }
                    }
                    if prev_doc_value && is_doc_value {
                        return Err(IrisError::invalid_argument(format!(
                            "doc values field \"{}\" appears more than once in this document \
                             (only one value is allowed per field)",
                            field.name
                        )));
                    }
                    false
                }
            };
            let entry = seen.entry(field.name.as_str()).or_insert((None, false));
            entry.0 = entry.0.or(options);
            entry.1 |= is_doc_value;

            if let Some(dv) = doc_values {
                dv.check(doc_id, field)?;
            }

            match &field.value {
                FieldValue::Tokens(tokens) => {
                    if first_instance {
                        if let Some(first) = tokens.first() {
                            if first.position_increment == 0 {
                                return Err(IrisError::invalid_argument(format!(
                                    "first position increment must be > 0 (field \"{}\")",
                                    field.name
                                )));
                            }
                        }
                    }
                    let span: u64 = tokens.iter().map(|t| u64::from(t.position_increment)).sum();
                    if span > i32::MAX as u64 {
                        return Err(IrisError::invalid_argument(format!(
                            "position overflow in field \"{}\"",
                            field.name
                        )));
                    }
                    if let Some(token) = tokens.iter().find(|t| t.text.len() > MAX_TERM_LENGTH) {
                        return Err(term_too_long(&field.name, token.text.len()));
                    }
                }
                FieldValue::Keyword(value) if value.len() > MAX_TERM_LENGTH => {
                    return Err(term_too_long(&field.name, value.len()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Run `doc` through every stage. Call [`validate`](Self::validate)
    /// first; an error from here leaves the buffer inconsistent and the
    /// caller must abort.
    pub fn process_document(&mut self, doc_id: DocId, doc: &Document) -> Result<()> {
        for field in doc.fields() {
            self.field_infos.add(field)?;
        }
        for stage in &mut self.stages {
            stage.start_document(doc_id);
        }
        for field in doc.fields() {
            let info = self.field_infos.get(&field.name).ok_or_else(|| {
                IrisError::internal(format!("field \"{}\" missing from field infos", field.name))
            })?;
            for stage in &mut self.stages {
                stage.process_field(doc_id, info, field)?;
            }
        }
        for stage in &mut self.stages {
            stage.finish_document(doc_id)?;
        }
        Ok(())
    }

    /// Flush every stage into `sink`. Term deletes in `deletes` mark
    /// documents in `deleted`.
    pub fn flush(
        &mut self,
        segment: &str,
        max_doc: DocId,
        sink: &mut dyn SegmentWriteSink,
        deletes: &BufferedUpdates,
        deleted: &mut BitVec,
    ) -> Result<()> {
        let mut ctx = FlushContext {
            segment,
            field_infos: &self.field_infos,
            max_doc,
            sink,
            deletes,
            deleted,
        };
        for stage in &mut self.stages {
            stage.flush(&mut ctx)?;
        }
        Ok(())
    }

    /// Abort every stage, even after one fails. Returns the first error.
    pub fn abort(&mut self) -> Result<()> {
        let mut first_error = None;
        for stage in &mut self.stages {
            if let Err(e) = stage.abort() {
                warn!("abort of the {} stage failed: {e}", stage.name());
                first_error.get_or_insert(e);
            }
        }
        self.field_infos = FieldInfos::new();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn term_too_long(field: &str, len: usize) -> IrisError {
    IrisError::capacity(format!(
        "field \"{field}\" contains a term of {len} bytes, longer than the maximum of {MAX_TERM_LENGTH}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{StoredValue, Term, Token};
    use crate::index::segment::MemorySegmentStore;
    use crate::index::sink::{SegmentStore, SegmentSummary};

    fn doc(body: &str, id: &str, rank: i64) -> Document {
        Document::builder()
            .add_tokens("body", body.split_whitespace())
            .add_field(Field::keyword("id", id).store(StoredValue::Text(id.to_string())))
            .add_numeric("rank", rank)
            .build()
    }

    #[test]
    fn test_flush_through_every_stage() {
        let mut chain = IndexingChain::new();
        for (i, d) in [doc("quick fox", "a", 5), doc("lazy dog", "b", 7), doc("quick dog", "c", 9)]
            .iter()
            .enumerate()
        {
            chain.validate(i as DocId, d).unwrap();
            chain.process_document(i as DocId, d).unwrap();
        }
        assert!(chain.bytes_used() > 0);

        let store = MemorySegmentStore::new();
        let mut sink = store.create_sink("_0").unwrap();
        let mut deletes = BufferedUpdates::new();
        deletes.add_term(Term::new("body", "dog"), 2);
        let mut deleted = BitVec::from_elem(3, false);
        chain
            .flush("_0", 3, sink.as_mut(), &deletes, &mut deleted)
            .unwrap();
        // the second dog arrived after the delete
        assert_eq!(deleted.iter().collect::<Vec<_>>(), vec![false, true, false]);

        sink.finish(&SegmentSummary {
            name: "_0".to_string(),
            max_doc: 3,
            deleted,
        })
        .unwrap();
        let segment = store.segment("_0").unwrap();
        let body = segment.field("body").unwrap();
        assert_eq!(body.term(b"quick").unwrap().doc_freq(), 2);
        assert_eq!(body.norms.as_ref().unwrap(), &vec![Some(2), Some(2), Some(2)]);
        let rank = segment.field("rank").unwrap();
        assert_eq!(rank.numeric.as_ref().unwrap(), &vec![Some(5), Some(7), Some(9)]);
        assert_eq!(segment.stored(2), &[("id".to_string(), StoredValue::Text("c".into()))]);
        assert_eq!(segment.num_docs(), 2);
    }

    #[test]
    fn test_validate_rejects_without_mutation() {
        let mut chain = IndexingChain::new();
        let ok = doc("quick", "a", 1);
        chain.process_document(0, &ok).unwrap();
        let before = chain.bytes_used();

        let twice = Document::builder()
            .add_numeric("rank", 1)
            .add_numeric("rank", 2)
            .build();
        assert!(chain.validate(1, &twice).is_err());

        let long = Document::builder()
            .add_keyword("id", "x".repeat(MAX_TERM_LENGTH + 1))
            .build();
        assert!(matches!(chain.validate(1, &long), Err(IrisError::Capacity(_))));

        let stacked_first = Document::builder()
            .add_field(Field::token_stream("body", vec![Token::new("a").with_position_increment(0)]))
            .build();
        assert!(chain.validate(1, &stacked_first).is_err());

        let conflicting = Document::builder()
            .add_field(Field::tokens("body", ["a"]).with_index_options(IndexOptions::Docs))
            .build();
        assert!(chain.validate(1, &conflicting).is_err());

        assert_eq!(chain.bytes_used(), before);
    }

    #[test]
    fn test_abort_clears_every_stage() {
        let mut chain = IndexingChain::new();
        chain.process_document(0, &doc("quick fox", "a", 1)).unwrap();
        chain.abort().unwrap();
        assert_eq!(chain.bytes_used(), 0);
        assert!(chain.field_infos().is_empty());
        assert!(chain.terms_hash().unwrap().field("body").is_none());
    }
}
