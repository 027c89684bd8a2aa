//! Buffered per-document values.
//!
//! Each field holds at most one value per document. Values are kept dense
//! in arrival order next to a docs-with-field bit set, and handed to the
//! sink as one entry per document with `None` for holes.

use std::collections::BTreeMap;

use bit_vec::BitVec;
use log::debug;

use crate::document::{DocId, Field, FieldValue};
use crate::error::{IrisError, Result};
use crate::index::chain::{FieldConsumer, FlushContext};
use crate::index::field_infos::{DocValuesType, FieldInfo};
use crate::pool::{BYTE_BLOCK_SIZE, ByteBlockPool, TrackingAllocator};
use crate::util::counter::Counter;

/// Longest binary value a document may carry.
pub const MAX_BINARY_LENGTH: usize = BYTE_BLOCK_SIZE - 2;

/// Yields one entry per document of `0..max_doc`, pulling the next dense
/// value for every document in `docs_with_field`.
pub struct DocValuesIter<'a, F> {
    docs_with_field: &'a BitVec,
    max_doc: usize,
    doc: usize,
    ord: usize,
    value_at: F,
}

impl<'a, T, F: FnMut(usize) -> T> DocValuesIter<'a, F> {
    pub fn new(docs_with_field: &'a BitVec, max_doc: usize, value_at: F) -> Self {
        DocValuesIter {
            docs_with_field,
            max_doc,
            doc: 0,
            ord: 0,
            value_at,
        }
    }
}

impl<T, F: FnMut(usize) -> T> Iterator for DocValuesIter<'_, F> {
    type Item = Option<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.doc >= self.max_doc {
            return None;
        }
        let has_value = self.docs_with_field.get(self.doc).unwrap_or(false);
        self.doc += 1;
        if has_value {
            let value = (self.value_at)(self.ord);
            self.ord += 1;
            Some(Some(value))
        } else {
            Some(None)
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.max_doc - self.doc;
        (remaining, Some(remaining))
    }
}

fn mark_doc(name: &str, docs_with_field: &mut BitVec, doc: DocId, bytes_used: &Counter) -> Result<()> {
    let doc = doc as usize;
    if docs_with_field.get(doc).unwrap_or(false) {
        return Err(IrisError::invalid_argument(format!(
            "doc values field \"{name}\" appears more than once in this document \
             (only one value is allowed per field)"
        )));
    }
    if doc >= docs_with_field.len() {
        let grow = doc + 1 - docs_with_field.len();
        let blocks_before = docs_with_field.storage().len();
        docs_with_field.grow(grow, false);
        let added = docs_with_field.storage().len() - blocks_before;
        bytes_used.add_and_get((added * std::mem::size_of::<u32>()) as i64);
    }
    docs_with_field.set(doc, true);
    Ok(())
}

/// Numeric values of one field.
#[derive(Debug)]
pub struct NumericDocValuesWriter {
    name: String,
    values: Vec<i64>,
    docs_with_field: BitVec,
    bytes_used: Counter,
}

impl NumericDocValuesWriter {
    pub fn new(name: &str, bytes_used: Counter) -> Self {
        NumericDocValuesWriter {
            name: name.to_string(),
            values: Vec::new(),
            docs_with_field: BitVec::new(),
            bytes_used,
        }
    }

    pub fn has_value(&self, doc: DocId) -> bool {
        self.docs_with_field.get(doc as usize).unwrap_or(false)
    }

    pub fn add(&mut self, doc: DocId, value: i64) -> Result<()> {
        mark_doc(&self.name, &mut self.docs_with_field, doc, &self.bytes_used)?;
        self.values.push(value);
        self.bytes_used.add_and_get(std::mem::size_of::<i64>() as i64);
        Ok(())
    }

    pub fn iter(&self, max_doc: usize) -> impl Iterator<Item = Option<i64>> + '_ {
        DocValuesIter::new(&self.docs_with_field, max_doc, |ord| self.values[ord])
    }
}

/// Binary values of one field, bytes kept in a block pool.
#[derive(Debug)]
pub struct BinaryDocValuesWriter {
    name: String,
    pool: ByteBlockPool,
    /// Address and length of every value, in arrival order.
    entries: Vec<(usize, u32)>,
    docs_with_field: BitVec,
    bytes_used: Counter,
}

impl BinaryDocValuesWriter {
    pub fn new(name: &str, bytes_used: Counter) -> Self {
        BinaryDocValuesWriter {
            name: name.to_string(),
            pool: ByteBlockPool::new(Box::new(TrackingAllocator::new(
                BYTE_BLOCK_SIZE,
                bytes_used.clone(),
            ))),
            entries: Vec::new(),
            docs_with_field: BitVec::new(),
            bytes_used,
        }
    }

    pub fn has_value(&self, doc: DocId) -> bool {
        self.docs_with_field.get(doc as usize).unwrap_or(false)
    }

    pub fn add(&mut self, doc: DocId, value: &[u8]) -> Result<()> {
        if value.len() > MAX_BINARY_LENGTH {
            return Err(IrisError::capacity(format!(
                "binary doc value of field \"{}\" is {} bytes, longer than the maximum of {MAX_BINARY_LENGTH}",
                self.name,
                value.len()
            )));
        }
        mark_doc(&self.name, &mut self.docs_with_field, doc, &self.bytes_used)?;
        let address = self.pool.append(value)?;
        self.entries.push((address, value.len() as u32));
        self.bytes_used
            .add_and_get(std::mem::size_of::<(usize, u32)>() as i64);
        Ok(())
    }

    pub fn iter(&self, max_doc: usize) -> impl Iterator<Item = Option<Vec<u8>>> + '_ {
        DocValuesIter::new(&self.docs_with_field, max_doc, |ord| {
            let (address, len) = self.entries[ord];
            let mut value = vec![0u8; len as usize];
            self.pool.read_bytes(address, &mut value);
            value
        })
    }
}

impl Drop for NumericDocValuesWriter {
    fn drop(&mut self) {
        let held = self.values.len() * std::mem::size_of::<i64>()
            + self.docs_with_field.storage().len() * std::mem::size_of::<u32>();
        self.bytes_used.add_and_get(-(held as i64));
    }
}

impl Drop for BinaryDocValuesWriter {
    fn drop(&mut self) {
        let held = self.entries.len() * std::mem::size_of::<(usize, u32)>()
            + self.docs_with_field.storage().len() * std::mem::size_of::<u32>();
        self.bytes_used.add_and_get(-(held as i64));
        self.pool.reset(false, false);
    }
}

#[derive(Debug)]
enum PerFieldWriter {
    Numeric(NumericDocValuesWriter),
    Binary(BinaryDocValuesWriter),
}

/// The doc-values stage of the indexing chain.
#[derive(Debug)]
pub struct DocValuesWriter {
    fields: BTreeMap<String, PerFieldWriter>,
    bytes_used: Counter,
}

impl DocValuesWriter {
    pub fn new(bytes_used: Counter) -> Self {
        DocValuesWriter {
            fields: BTreeMap::new(),
            bytes_used,
        }
    }

    /// Reject a value that [`process_field`](FieldConsumer::process_field)
    /// would refuse, without buffering anything.
    pub fn check(&self, doc: DocId, field: &Field) -> Result<()> {
        let (has_value, len) = match (&field.value, self.fields.get(&field.name)) {
            (FieldValue::Numeric(_), Some(PerFieldWriter::Numeric(w))) => (w.has_value(doc), 0),
            (FieldValue::Binary(v), Some(PerFieldWriter::Binary(w))) => (w.has_value(doc), v.len()),
            (FieldValue::Binary(v), _) => (false, v.len()),
            _ => (false, 0),
        };
        if has_value {
            return Err(IrisError::invalid_argument(format!(
                "doc values field \"{}\" appears more than once in this document \
                 (only one value is allowed per field)",
                field.name
            )));
        }
        if len > MAX_BINARY_LENGTH {
            return Err(IrisError::capacity(format!(
                "binary doc value of field \"{}\" is {len} bytes, longer than the maximum of {MAX_BINARY_LENGTH}",
                field.name
            )));
        }
        Ok(())
    }
}

impl FieldConsumer for DocValuesWriter {
    fn process_field(&mut self, doc: DocId, info: &FieldInfo, field: &Field) -> Result<()> {
        let bytes_used = &self.bytes_used;
        match (&field.value, info.doc_values) {
            (FieldValue::Numeric(value), Some(DocValuesType::Numeric)) => {
                let writer = self.fields.entry(info.name.clone()).or_insert_with(|| {
                    PerFieldWriter::Numeric(NumericDocValuesWriter::new(&info.name, bytes_used.clone()))
                });
                match writer {
                    PerFieldWriter::Numeric(w) => w.add(doc, *value),
                    PerFieldWriter::Binary(_) => Err(IrisError::internal(format!(
                        "field \"{}\" buffered as binary doc values",
                        info.name
                    ))),
                }
            }
            (FieldValue::Binary(value), Some(DocValuesType::Binary)) => {
                let writer = self.fields.entry(info.name.clone()).or_insert_with(|| {
                    PerFieldWriter::Binary(BinaryDocValuesWriter::new(&info.name, bytes_used.clone()))
                });
                match writer {
                    PerFieldWriter::Binary(w) => w.add(doc, value),
                    PerFieldWriter::Numeric(_) => Err(IrisError::internal(format!(
                        "field \"{}\" buffered as numeric doc values",
                        info.name
                    ))),
                }
            }
            _ => Ok(()),
        }
    }

    fn flush(&mut self, ctx: &mut FlushContext<'_>) -> Result<()> {
        let max_doc = ctx.max_doc as usize;
        for info in ctx.field_infos.iter() {
            match self.fields.get(&info.name) {
                Some(PerFieldWriter::Numeric(writer)) => {
                    ctx.sink.write_numeric(info, &mut writer.iter(max_doc))?;
                }
                Some(PerFieldWriter::Binary(writer)) => {
                    ctx.sink.write_binary(info, &mut writer.iter(max_doc))?;
                }
                None => {}
            }
        }
        debug!("flushed doc values of {} fields", self.fields.len());
        self.fields.clear();
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
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

    #[test]
    fn test_numeric_holes_are_none() {
        let mut writer = NumericDocValuesWriter::new("rank", Counter::new());
        writer.add(0, 5).unwrap();
        writer.add(2, 7).unwrap();
        let values: Vec<Option<i64>> = writer.iter(4).collect();
        assert_eq!(values, vec![Some(5), None, Some(7), None]);
    }

    #[test]
    fn test_second_value_in_document_is_rejected() {
        let mut writer = NumericDocValuesWriter::new("rank", Counter::new());
        writer.add(3, 1).unwrap();
        let err = writer.add(3, 2).unwrap_err();
        assert!(matches!(err, IrisError::InvalidArgument(_)));
        assert_eq!(writer.iter(4).flatten().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_binary_values_and_limits() {
        let counter = Counter::new();
        let mut writer = BinaryDocValuesWriter::new("payload", counter.clone());
        writer.add(1, b"abc").unwrap();
        writer.add(2, &vec![9u8; MAX_BINARY_LENGTH]).unwrap();
        let err = writer.add(3, &vec![0u8; MAX_BINARY_LENGTH + 1]).unwrap_err();
        assert!(matches!(err, IrisError::Capacity(_)));

        let values: Vec<Option<Vec<u8>>> = writer.iter(3).collect();
        assert_eq!(values[0], None);
        assert_eq!(values[1].as_deref(), Some(&b"abc"[..]));
        assert_eq!(values[2].as_ref().map(Vec::len), Some(MAX_BINARY_LENGTH));

        assert!(counter.get() > 0);
        drop(writer);
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn test_check_matches_add() {
        let mut stage = DocValuesWriter::new(Counter::new());
        let info = FieldInfo {
            name: "rank".to_string(),
            number: 0,
            index_options: None,
            omit_norms: false,
            doc_values: Some(DocValuesType::Numeric),
        };
        let field = Field::numeric_doc_value("rank", 3);
        stage.check(0, &field).unwrap();
        stage.process_field(0, &info, &field).unwrap();
        assert!(stage.check(0, &field).is_err());
        stage.check(1, &field).unwrap();
        assert!(stage.check(1, &Field::binary_doc_value("blob", vec![0; MAX_BINARY_LENGTH + 1])).is_err());
    }
}
