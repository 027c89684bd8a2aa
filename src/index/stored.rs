//! Stored fields stage: buffers the retrievable values of every document.

use std::mem;

use crate::document::{DocId, Field, StoredValue};
use crate::error::Result;
use crate::index::chain::{FieldConsumer, FlushContext};
use crate::index::field_infos::FieldInfo;
use crate::util::counter::Counter;

/// Rough per-value overhead: the tuple plus the enum tag.
const BYTES_PER_VALUE: usize = mem::size_of::<(String, StoredValue)>();

fn value_bytes(name: &str, value: &StoredValue) -> usize {
    let payload = match value {
        StoredValue::Text(s) => s.len(),
        StoredValue::Binary(b) => b.len(),
        StoredValue::Integer(_) | StoredValue::Float(_) => 0,
    };
    BYTES_PER_VALUE + name.len() + payload
}

#[derive(Debug)]
pub struct StoredFieldsWriter {
    docs: Vec<Vec<(String, StoredValue)>>,
    current: Vec<(String, StoredValue)>,
    bytes_used: Counter,
}

impl StoredFieldsWriter {
    pub fn new(bytes_used: Counter) -> Self {
        StoredFieldsWriter {
            docs: Vec::new(),
            current: Vec::new(),
            bytes_used,
        }
    }

    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }

    fn release(&mut self) {
        let held: usize = self
            .docs
            .iter()
            .chain(std::iter::once(&self.current))
            .flatten()
            .map(|(name, value)| value_bytes(name, value))
            .sum();
        self.bytes_used.add_and_get(-(held as i64));
        self.docs.clear();
        self.current.clear();
    }
}

impl FieldConsumer for StoredFieldsWriter {
    fn start_document(&mut self, _doc: DocId) {
        debug_assert!(self.current.is_empty());
    }

    fn process_field(&mut self, _doc: DocId, _info: &FieldInfo, field: &Field) -> Result<()> {
        if let Some(value) = field.stored_value() {
            self.bytes_used
                .add_and_get(value_bytes(&field.name, value) as i64);
            self.current.push((field.name.clone(), value.clone()));
        }
        Ok(())
    }

    fn finish_document(&mut self, doc: DocId) -> Result<()> {
        // documents that never reached this stage store nothing
        self.docs.resize_with(doc as usize, Vec::new);
        self.docs.push(mem::take(&mut self.current));
        Ok(())
    }

    fn flush(&mut self, ctx: &mut FlushContext<'_>) -> Result<()> {
        let max_doc = ctx.max_doc as usize;
        self.docs.resize_with(max_doc, Vec::new);
        let mut documents = self.docs.iter().cloned();
        ctx.sink.write_stored(&mut documents)?;
        self.release();
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }

    fn bytes_used(&self) -> u64 {
        self.bytes_used.get().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holes_and_accounting() {
        let counter = Counter::new();
        let mut stored = StoredFieldsWriter::new(counter.clone());
        let info = FieldInfo {
            name: "id".to_string(),
            number: 0,
            index_options: None,
            omit_norms: false,
            doc_values: None,
        };
        let field = Field::stored("id", StoredValue::Text("a".into()));

        stored.start_document(0);
        stored.process_field(0, &info, &field).unwrap();
        stored.finish_document(0).unwrap();
        stored.start_document(2);
        stored.process_field(2, &info, &field).unwrap();
        stored.finish_document(2).unwrap();

        assert_eq!(stored.num_docs(), 3);
        assert!(stored.docs[1].is_empty());
        assert!(counter.get() > 0);
        stored.abort().unwrap();
        assert_eq!(counter.get(), 0);
    }
}
