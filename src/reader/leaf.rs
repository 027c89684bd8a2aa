//! The leaf reader capability.
//!
//! A leaf reader exposes one immutable segment. Field statistics are
//! `Option<u64>`: `None` means the segment cannot report that statistic (for
//! example total term frequency on a field indexed without frequencies).

use std::collections::BTreeMap;
use std::fmt;

use ahash::AHashSet;

use crate::document::{DocId, StoredValue, Term};
use crate::error::Result;
use crate::reader::registry::ReaderId;

/// What a [`StoredFieldVisitor`] wants done with the next stored field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitStatus {
    Yes,
    No,
    /// Skip this field and every field after it.
    Stop,
}

/// Receives the stored fields of one document.
pub trait StoredFieldVisitor {
    fn needs_field(&mut self, field: &str) -> VisitStatus;

    fn stored_field(&mut self, field: &str, value: &StoredValue) -> Result<()>;
}

/// Collects stored fields, optionally restricted to a set of names.
#[derive(Debug, Default)]
pub struct DocumentStoredFieldVisitor {
    fields_to_load: Option<AHashSet<String>>,
    fields: Vec<(String, StoredValue)>,
}

impl DocumentStoredFieldVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DocumentStoredFieldVisitor {
            fields_to_load: Some(fields.into_iter().map(Into::into).collect()),
            fields: Vec::new(),
        }
    }

    pub fn fields(&self) -> &[(String, StoredValue)] {
        &self.fields
    }

    pub fn into_fields(self) -> Vec<(String, StoredValue)> {
        self.fields
    }
}

impl StoredFieldVisitor for DocumentStoredFieldVisitor {
    fn needs_field(&mut self, field: &str) -> VisitStatus {
        match &self.fields_to_load {
            Some(wanted) if !wanted.contains(field) => VisitStatus::No,
            _ => VisitStatus::Yes,
        }
    }

    fn stored_field(&mut self, field: &str, value: &StoredValue) -> Result<()> {
        self.fields.push((field.to_string(), value.clone()));
        Ok(())
    }
}

/// One term of a document's term vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermVectorEntry {
    pub term: Vec<u8>,
    pub freq: u32,
    pub positions: Vec<u32>,
}

/// Per-field term vectors of one document, terms in byte order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermVectors {
    fields: BTreeMap<String, Vec<TermVectorEntry>>,
}

impl TermVectors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: String, mut terms: Vec<TermVectorEntry>) {
        terms.sort_by(|a, b| a.term.cmp(&b.term));
        self.fields.insert(field, terms);
    }

    pub fn field(&self, field: &str) -> Option<&[TermVectorEntry]> {
        self.fields.get(field).map(Vec::as_slice)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Read access to a single immutable segment.
pub trait LeafReader: Send + Sync + fmt::Debug {
    fn reader_id(&self) -> ReaderId;

    /// One greater than the largest document id, deleted documents included.
    fn max_doc(&self) -> DocId;

    /// Number of live documents.
    fn num_docs(&self) -> DocId;

    fn has_deletions(&self) -> bool {
        self.num_docs() < self.max_doc()
    }

    /// Term vectors of a document, or `None` if it has none.
    fn term_vectors(&self, doc: DocId) -> Result<Option<TermVectors>>;

    fn visit_stored_fields(&self, doc: DocId, visitor: &mut dyn StoredFieldVisitor)
    -> Result<()>;

    fn doc_freq(&self, term: &Term) -> Result<Option<u64>>;

    fn total_term_freq(&self, term: &Term) -> Result<Option<u64>>;

    fn sum_doc_freq(&self, field: &str) -> Result<Option<u64>>;

    fn doc_count(&self, field: &str) -> Result<Option<u64>>;

    fn sum_total_term_freq(&self, field: &str) -> Result<Option<u64>>;

    /// Documents containing `term`, in increasing order, deleted ones
    /// included.
    fn docs_with_term(&self, term: &Term) -> Result<Vec<DocId>>;

    /// Record that a composite now wraps this reader.
    fn register_parent_reader(&self, parent: ReaderId);

    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visitor_filters_fields() {
        let mut visitor = DocumentStoredFieldVisitor::with_fields(["title"]);
        assert_eq!(visitor.needs_field("title"), VisitStatus::Yes);
        assert_eq!(visitor.needs_field("body"), VisitStatus::No);

        let mut all = DocumentStoredFieldVisitor::new();
        assert_eq!(all.needs_field("anything"), VisitStatus::Yes);
        all.stored_field("n", &StoredValue::Integer(3)).unwrap();
        assert_eq!(all.into_fields(), vec![("n".to_string(), StoredValue::Integer(3))]);
    }

    #[test]
    fn test_term_vectors_sorted_by_term() {
        let mut vectors = TermVectors::new();
        vectors.insert(
            "body".to_string(),
            vec![
                TermVectorEntry {
                    term: b"zeta".to_vec(),
                    freq: 1,
                    positions: vec![1],
                },
                TermVectorEntry {
                    term: b"alpha".to_vec(),
                    freq: 2,
                    positions: vec![0, 2],
                },
            ],
        );
        let body = vectors.field("body").unwrap();
        assert_eq!(body[0].term, b"alpha");
        assert_eq!(body[1].term, b"zeta");
        assert_eq!(vectors.field_names().collect::<Vec<_>>(), vec!["body"]);
    }
}
