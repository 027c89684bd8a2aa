//! Per-field length norms.
//!
//! The norm of an indexed field is the number of tokens it held in the
//! document, not counting tokens stacked on an earlier position. Fields that
//! omit norms, or that later switch to omitting them, produce none.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::document::{DocId, Field, FieldValue};
use crate::error::Result;
use crate::index::chain::{FieldConsumer, FlushContext};
use crate::index::doc_values::NumericDocValuesWriter;
use crate::index::field_infos::FieldInfo;
use crate::util::counter::Counter;

#[derive(Debug)]
pub struct NormsWriter {
    fields: BTreeMap<String, NumericDocValuesWriter>,
    /// Lengths of the document being processed.
    pending: AHashMap<String, i64>,
    bytes_used: Counter,
}

impl NormsWriter {
    pub fn new(bytes_used: Counter) -> Self {
        NormsWriter {
            fields: BTreeMap::new(),
            pending: AHashMap::new(),
            bytes_used,
        }
    }
}

fn field_length(field: &Field) -> i64 {
    match &field.value {
        FieldValue::Tokens(tokens) => tokens
            .iter()
            .filter(|t| t.position_increment > 0)
            .count() as i64,
        FieldValue::Keyword(_) => 1,
        _ => 0,
    }
}

impl FieldConsumer for NormsWriter {
    fn start_document(&mut self, _doc: DocId) {
        self.pending.clear();
    }

    fn process_field(&mut self, _doc: DocId, info: &FieldInfo, field: &Field) -> Result<()> {
        if field.is_indexed() && info.is_indexed() {
            *self.pending.entry(info.name.clone()).or_default() += field_length(field);
        }
        Ok(())
    }

    fn finish_document(&mut self, doc: DocId) -> Result<()> {
        for (name, length) in self.pending.drain() {
            let bytes_used = &self.bytes_used;
            let writer = self
                .fields
                .entry(name)
                .or_insert_with_key(|name| NumericDocValuesWriter::new(name, bytes_used.clone()));
            writer.add(doc, length)?;
        }
        Ok(())
    }

    fn flush(&mut self, ctx: &mut FlushContext<'_>) -> Result<()> {
        let max_doc = ctx.max_doc as usize;
        for info in ctx.field_infos.iter().filter(|info| info.has_norms()) {
            if let Some(writer) = self.fields.get(&info.name) {
                ctx.sink.write_norms(info, &mut writer.iter(max_doc))?;
            }
        }
        self.fields.clear();
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.pending.clear();
        self.fields.clear();
        Ok(())
    }

    fn bytes_used(&self) -> u64 {
        self.bytes_used.get().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{IndexOptions, Token};

    fn info(name: &str) -> FieldInfo {
        FieldInfo {
            name: name.to_string(),
            number: 0,
            index_options: Some(IndexOptions::DocsAndFreqsAndPositions),
            omit_norms: false,
            doc_values: None,
        }
    }

    fn add(norms: &mut NormsWriter, doc: DocId, fields: &[Field]) {
        norms.start_document(doc);
        for field in fields {
            norms.process_field(doc, &info(&field.name), field).unwrap();
        }
        norms.finish_document(doc).unwrap();
    }

    #[test]
    fn test_lengths_per_document() {
        let mut norms = NormsWriter::new(Counter::new());
        add(&mut norms, 0, &[Field::tokens("body", ["a", "b", "c"])]);
        add(&mut norms, 2, &[
            Field::tokens("body", ["a"]),
            Field::tokens("body", ["b", "c"]),
            Field::keyword("id", "x"),
        ]);
        add(&mut norms, 3, &[Field::token_stream(
            "body",
            vec![Token::new("a"), Token::new("b").with_position_increment(0)],
        )]);

        let body: Vec<Option<i64>> = norms.fields["body"].iter(4).collect();
        assert_eq!(body, vec![Some(3), None, Some(3), Some(1)]);
        let id: Vec<Option<i64>> = norms.fields["id"].iter(4).collect();
        assert_eq!(id, vec![None, None, Some(1), None]);
    }
}
