//! In-memory inverted postings.
//!
//! Every indexed field gets a [`TermsHashPerField`]. All fields of one
//! writer share a byte pool (term bytes and posting streams) and an int pool
//! (the current write address of every stream).
//!
//! Per term, stream 0 holds doc codes and frequencies, stream 1 holds
//! positions:
//!
//! * without frequencies a doc code is the doc delta;
//! * with frequencies it is `delta << 1`, with the low bit set when the
//!   frequency is 1, otherwise followed by the frequency;
//! * positions are written as `delta << 1`, restarting from 0 in every doc.
//!
//! The last document of every term stays pending in the posting arrays and
//! is only emitted at flush.

use std::collections::BTreeMap;

use ahash::AHashMap;
use bit_vec::BitVec;
use log::debug;

use crate::document::{DocId, Field, FieldValue, IndexOptions};
use crate::error::{IrisError, Result};
use crate::index::bytes_hash::{BytesRefHash, TermSlot};
use crate::index::chain::{FieldConsumer, FlushContext};
use crate::index::field_infos::FieldInfo;
use crate::index::sink::{DocPosting, TermPostings};
use crate::pool::{
    BYTE_BLOCK_SIZE, ByteBlockPool, ByteSliceReader, ByteSliceWriter, FIRST_LEVEL_SIZE,
    INT_BLOCK_SIZE, IntBlockPool, TrackingAllocator,
};
use crate::util::counter::Counter;
use crate::util::varint::{read_vu32, write_vu32};

const FREQ_STREAM: usize = 0;
const PROX_STREAM: usize = 1;

/// int start, byte start, last doc id, last doc code, term freq, last position
const BYTES_PER_POSTING: i64 = 8 + 8 + 4 + 4 + 4 + 4;

#[derive(Debug, Default)]
struct PostingArrays {
    int_starts: Vec<usize>,
    byte_starts: Vec<usize>,
    last_doc_ids: Vec<DocId>,
    last_doc_codes: Vec<u32>,
    term_freqs: Vec<u32>,
    last_positions: Vec<u32>,
}

impl PostingArrays {
    fn push(&mut self, int_start: usize, byte_start: usize) {
        self.int_starts.push(int_start);
        self.byte_starts.push(byte_start);
        self.last_doc_ids.push(0);
        self.last_doc_codes.push(0);
        self.term_freqs.push(0);
        self.last_positions.push(0);
    }
}

/// Byte and int pools shared by every field of one writer.
#[derive(Debug)]
pub struct PostingPools {
    bytes: ByteBlockPool,
    ints: IntBlockPool,
}

impl PostingPools {
    fn new(bytes_used: &Counter) -> Self {
        PostingPools {
            bytes: ByteBlockPool::new(Box::new(TrackingAllocator::new(
                BYTE_BLOCK_SIZE,
                bytes_used.clone(),
            ))),
            ints: IntBlockPool::new(Box::new(TrackingAllocator::new(
                INT_BLOCK_SIZE,
                bytes_used.clone(),
            ))),
        }
    }

    fn reset(&mut self) {
        self.bytes.reset(true, false);
        self.ints.reset(true, false);
    }

    fn write_vint(&mut self, int_start: usize, stream: usize, value: u32) -> Result<()> {
        let slot = int_start + stream;
        let address = self.ints.get(slot) as usize;
        let mut writer = ByteSliceWriter::new(&mut self.bytes, address);
        write_vu32(&mut writer, value)?;
        let end = to_u32(writer.address())?;
        self.ints.set(slot, end);
        Ok(())
    }
}

fn to_u32(address: usize) -> Result<u32> {
    u32::try_from(address)
        .map_err(|_| IrisError::capacity(format!("pool address {address} exceeds 32 bits")))
}

/// Postings of one field.
#[derive(Debug)]
pub struct TermsHashPerField {
    name: String,
    options: IndexOptions,
    stream_count: usize,
    hash: BytesRefHash,
    postings: PostingArrays,
    bytes_used: Counter,
    doc: DocId,
    /// Position of the last token of the current document, -1 before the
    /// first one.
    position: i64,
}

impl TermsHashPerField {
    fn new(name: &str, options: IndexOptions, bytes_used: Counter) -> Self {
        TermsHashPerField {
            name: name.to_string(),
            options,
            stream_count: if options.has_positions() { 2 } else { 1 },
            hash: BytesRefHash::new(bytes_used.clone()),
            postings: PostingArrays::default(),
            bytes_used,
            doc: -1,
            position: -1,
        }
    }

    pub fn num_terms(&self) -> usize {
        self.hash.len()
    }

    fn add_occurrence(
        &mut self,
        pools: &mut PostingPools,
        bytes: &[u8],
        doc: DocId,
        position: u32,
    ) -> Result<()> {
        match self.hash.add(&mut pools.bytes, bytes)? {
            TermSlot::New(id) => self.new_term(pools, id, doc, position),
            TermSlot::Existing(id) => self.add_term(pools, id, doc, position),
        }
    }

    fn new_term(&mut self, pools: &mut PostingPools, id: usize, doc: DocId, position: u32) -> Result<()> {
        debug_assert_eq!(id, self.postings.int_starts.len());
        let int_start = pools.ints.reserve(self.stream_count)?;

        // keep every stream of the term in one block, first regions back to back
        let needed = self.stream_count * FIRST_LEVEL_SIZE;
        if pools.bytes.buffer_upto().is_none() || pools.bytes.byte_upto() + needed > BYTE_BLOCK_SIZE {
            pools.bytes.next_buffer()?;
        }
        let byte_start = pools.bytes.new_slice(0)?;
        pools.ints.set(int_start, to_u32(byte_start)?);
        for stream in 1..self.stream_count {
            let start = pools.bytes.new_slice(0)?;
            debug_assert_eq!(start, byte_start + stream * FIRST_LEVEL_SIZE);
            pools.ints.set(int_start + stream, to_u32(start)?);
        }

        self.postings.push(int_start, byte_start);
        self.bytes_used.add_and_get(BYTES_PER_POSTING);

        self.postings.last_doc_ids[id] = doc;
        if self.options.has_freqs() {
            self.postings.last_doc_codes[id] = (doc as u32) << 1;
            self.postings.term_freqs[id] = 1;
            if self.options.has_positions() {
                self.write_prox(pools, id, position, position)?;
            }
        } else {
            self.postings.last_doc_codes[id] = doc as u32;
        }
        Ok(())
    }

    fn add_term(&mut self, pools: &mut PostingPools, id: usize, doc: DocId, position: u32) -> Result<()> {
        let int_start = self.postings.int_starts[id];
        let last_doc = self.postings.last_doc_ids[id];

        if !self.options.has_freqs() {
            if doc != last_doc {
                pools.write_vint(int_start, FREQ_STREAM, self.postings.last_doc_codes[id])?;
                self.postings.last_doc_codes[id] = (doc - last_doc) as u32;
                self.postings.last_doc_ids[id] = doc;
            }
            return Ok(());
        }

        if doc != last_doc {
            debug_assert!(doc > last_doc, "docs must arrive in increasing order");
            let code = self.postings.last_doc_codes[id];
            let freq = self.postings.term_freqs[id];
            if freq == 1 {
                pools.write_vint(int_start, FREQ_STREAM, code | 1)?;
            } else {
                pools.write_vint(int_start, FREQ_STREAM, code)?;
                pools.write_vint(int_start, FREQ_STREAM, freq)?;
            }
            self.postings.term_freqs[id] = 1;
            self.postings.last_doc_codes[id] = ((doc - last_doc) as u32) << 1;
            self.postings.last_doc_ids[id] = doc;
            if self.options.has_positions() {
                self.write_prox(pools, id, position, position)?;
            }
        } else {
            let freq = &mut self.postings.term_freqs[id];
            *freq = freq.checked_add(1).ok_or_else(|| {
                IrisError::capacity(format!("term frequency overflow in field \"{}\"", self.name))
            })?;
            if self.options.has_positions() {
                let delta = position - self.postings.last_positions[id];
                self.write_prox(pools, id, delta, position)?;
            }
        }
        Ok(())
    }

    fn write_prox(&mut self, pools: &mut PostingPools, id: usize, code: u32, position: u32) -> Result<()> {
        pools.write_vint(self.postings.int_starts[id], PROX_STREAM, code << 1)?;
        self.postings.last_positions[id] = position;
        Ok(())
    }

    /// Invert one field instance of document `doc`.
    fn invert(&mut self, pools: &mut PostingPools, doc: DocId, field: &Field) -> Result<()> {
        if self.doc != doc {
            self.doc = doc;
            self.position = -1;
        }
        match &field.value {
            FieldValue::Tokens(tokens) => {
                for token in tokens {
                    self.position += i64::from(token.position_increment);
                    let position = self.current_position()?;
                    self.add_occurrence(pools, token.text.as_bytes(), doc, position)?;
                }
            }
            FieldValue::Keyword(value) => {
                self.position += 1;
                let position = self.current_position()?;
                self.add_occurrence(pools, value.as_bytes(), doc, position)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn current_position(&self) -> Result<u32> {
        if self.position < 0 || self.position > i64::from(i32::MAX) {
            return Err(IrisError::invalid_argument(format!(
                "position {} out of range in field \"{}\"",
                self.position, self.name
            )));
        }
        Ok(self.position as u32)
    }

    /// Read back every posting of term `id`, including the pending last doc.
    fn read_postings(&self, pools: &PostingPools, id: usize) -> Result<TermPostings> {
        let int_start = self.postings.int_starts[id];
        let byte_start = self.postings.byte_starts[id];
        let has_freqs = self.options.has_freqs();

        let mut freq_reader = ByteSliceReader::new(
            &pools.bytes,
            byte_start,
            pools.ints.get(int_start + FREQ_STREAM) as usize,
        )?;
        let mut prox_reader = if self.options.has_positions() {
            Some(ByteSliceReader::new(
                &pools.bytes,
                byte_start + PROX_STREAM * FIRST_LEVEL_SIZE,
                pools.ints.get(int_start + PROX_STREAM) as usize,
            )?)
        } else {
            None
        };

        let mut read_positions = |freq: u32| -> Result<Vec<u32>> {
            let Some(reader) = prox_reader.as_mut() else {
                return Ok(Vec::new());
            };
            let mut positions = Vec::with_capacity(freq as usize);
            let mut position = 0u32;
            for _ in 0..freq {
                position += read_vu32(reader)? >> 1;
                positions.push(position);
            }
            Ok(positions)
        };

        let mut docs = Vec::new();
        let mut doc: DocId = 0;
        while !freq_reader.eof() {
            let code = read_vu32(&mut freq_reader)?;
            let freq = if has_freqs {
                doc += (code >> 1) as DocId;
                if code & 1 != 0 {
                    1
                } else {
                    read_vu32(&mut freq_reader)?
                }
            } else {
                doc += code as DocId;
                1
            };
            let positions = read_positions(freq)?;
            docs.push(DocPosting { doc, freq, positions });
        }

        let last_freq = if has_freqs {
            self.postings.term_freqs[id]
        } else {
            1
        };
        let positions = read_positions(last_freq)?;
        docs.push(DocPosting {
            doc: self.postings.last_doc_ids[id],
            freq: last_freq,
            positions,
        });

        Ok(TermPostings {
            term: self.hash.get(&pools.bytes, id).to_vec(),
            docs,
        })
    }
}

impl Drop for TermsHashPerField {
    fn drop(&mut self) {
        let held = self.postings.int_starts.len() as i64 * BYTES_PER_POSTING;
        self.bytes_used.add_and_get(-held);
    }
}

/// Streams one field's postings in term order, marking docs hit by buffered
/// term deletes on the way.
struct FieldPostingsIter<'a> {
    field: &'a TermsHashPerField,
    pools: &'a PostingPools,
    order: std::vec::IntoIter<usize>,
    deletes: AHashMap<&'a [u8], DocId>,
    deleted: &'a mut BitVec,
}

impl Iterator for FieldPostingsIter<'_> {
    type Item = Result<TermPostings>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.order.next()?;
        let postings = match self.field.read_postings(self.pools, id) {
            Ok(postings) => postings,
            Err(e) => return Some(Err(e)),
        };
        if let Some(&limit) = self.deletes.get(postings.term.as_slice()) {
            for posting in postings.docs.iter().take_while(|p| p.doc < limit) {
                self.deleted.set(posting.doc as usize, true);
            }
        }
        Some(Ok(postings))
    }
}

/// The terms-hash stage of the indexing chain.
#[derive(Debug)]
pub struct TermsHash {
    pools: PostingPools,
    // ordered by name so flush order does not depend on hashing
    fields: BTreeMap<String, TermsHashPerField>,
    bytes_used: Counter,
}

impl TermsHash {
    pub fn new(bytes_used: Counter) -> Self {
        TermsHash {
            pools: PostingPools::new(&bytes_used),
            fields: BTreeMap::new(),
            bytes_used,
        }
    }

    pub fn field(&self, name: &str) -> Option<&TermsHashPerField> {
        self.fields.get(name)
    }

    /// Postings of one buffered term, if present.
    pub fn postings(&self, field: &str, term: &[u8]) -> Result<Option<TermPostings>> {
        let Some(per_field) = self.fields.get(field) else {
            return Ok(None);
        };
        match per_field.hash.find(&self.pools.bytes, term) {
            Some(id) => per_field.read_postings(&self.pools, id).map(Some),
            None => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.fields.clear();
        self.pools.reset();
    }
}

impl FieldConsumer for TermsHash {
    fn process_field(&mut self, doc: DocId, info: &FieldInfo, field: &Field) -> Result<()> {
        let Some(options) = info.index_options else {
            return Ok(());
        };
        if !field.is_indexed() {
            return Ok(());
        }
        let per_field = self
            .fields
            .entry(info.name.clone())
            .or_insert_with(|| TermsHashPerField::new(&info.name, options, self.bytes_used.clone()));
        per_field.invert(&mut self.pools, doc, field)
    }

    fn flush(&mut self, ctx: &mut FlushContext<'_>) -> Result<()> {
        for info in ctx.field_infos.iter() {
            let Some(per_field) = self.fields.get(&info.name) else {
                continue;
            };
            let deletes: AHashMap<&[u8], DocId> = ctx
                .deletes
                .term_deletes(&info.name)
                .map(|(term, limit)| (term.bytes.as_slice(), limit))
                .collect();
            let mut iter = FieldPostingsIter {
                field: per_field,
                pools: &self.pools,
                order: per_field.hash.sort(&self.pools.bytes).into_iter(),
                deletes,
                deleted: &mut *ctx.deleted,
            };
            debug!(
                "flushing {} terms of field \"{}\"",
                per_field.num_terms(),
                info.name
            );
            ctx.sink.write_postings(info, &mut iter)?;
        }
        self.reset();
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.reset();
        Ok(())
    }

    fn bytes_used(&self) -> u64 {
        self.bytes_used.get().max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Token;

    fn field(options: IndexOptions) -> (FieldInfo, Counter, TermsHash) {
        let info = FieldInfo {
            name: "body".to_string(),
            number: 0,
            index_options: Some(options),
            omit_norms: false,
            doc_values: None,
        };
        let counter = Counter::new();
        let terms = TermsHash::new(counter.clone());
        (info, counter, terms)
    }

    fn text(words: &str) -> Field {
        Field::tokens("body", words.split_whitespace())
    }

    #[test]
    fn test_freqs_and_positions_round_trip() {
        let (info, _, mut terms) = field(IndexOptions::DocsAndFreqsAndPositions);
        terms.process_field(0, &info, &text("the quick fox the")).unwrap();
        terms.process_field(2, &info, &text("fox")).unwrap();
        terms.process_field(5, &info, &text("the the the fox")).unwrap();

        let the = terms.postings("body", b"the").unwrap().unwrap();
        assert_eq!(the.docs.len(), 2);
        assert_eq!(the.docs[0], DocPosting { doc: 0, freq: 2, positions: vec![0, 3] });
        assert_eq!(the.docs[1], DocPosting { doc: 5, freq: 3, positions: vec![0, 1, 2] });

        let fox = terms.postings("body", b"fox").unwrap().unwrap();
        let docs: Vec<(DocId, u32)> = fox.docs.iter().map(|d| (d.doc, d.freq)).collect();
        assert_eq!(docs, vec![(0, 1), (2, 1), (5, 1)]);
        assert_eq!(fox.docs[2].positions, vec![3]);
        assert!(terms.postings("body", b"dog").unwrap().is_none());
    }

    #[test]
    fn test_docs_only_field() {
        let (info, _, mut terms) = field(IndexOptions::Docs);
        for doc in [1, 4, 4, 300] {
            terms.process_field(doc, &info, &text("quick quick")).unwrap();
        }
        let quick = terms.postings("body", b"quick").unwrap().unwrap();
        let docs: Vec<DocId> = quick.docs.iter().map(|d| d.doc).collect();
        assert_eq!(docs, vec![1, 4, 300]);
        assert!(quick.docs.iter().all(|d| d.freq == 1 && d.positions.is_empty()));
    }

    #[test]
    fn test_position_increments_and_multiple_instances() {
        let (info, _, mut terms) = field(IndexOptions::DocsAndFreqsAndPositions);
        let stacked = Field::token_stream(
            "body",
            vec![
                Token::new("wifi"),
                Token::new("wireless").with_position_increment(0),
                Token::new("network").with_position_increment(2),
            ],
        );
        terms.process_field(0, &info, &stacked).unwrap();
        // a second instance continues the position sequence
        terms.process_field(0, &info, &text("wifi")).unwrap();

        let wifi = terms.postings("body", b"wifi").unwrap().unwrap();
        assert_eq!(wifi.docs[0].positions, vec![0, 3]);
        let wireless = terms.postings("body", b"wireless").unwrap().unwrap();
        assert_eq!(wireless.docs[0].positions, vec![0]);
        let network = terms.postings("body", b"network").unwrap().unwrap();
        assert_eq!(network.docs[0].positions, vec![2]);
    }

    #[test]
    fn test_many_docs_grow_slices() {
        let (info, counter, mut terms) = field(IndexOptions::DocsAndFreqsAndPositions);
        for doc in 0..5000 {
            let words = if doc % 3 == 0 { "common rare" } else { "common common" };
            terms.process_field(doc, &info, &text(words)).unwrap();
        }
        assert!(terms.bytes_used() >= BYTE_BLOCK_SIZE as u64);

        let common = terms.postings("body", b"common").unwrap().unwrap();
        assert_eq!(common.doc_freq(), 5000);
        assert_eq!(common.docs[1], DocPosting { doc: 1, freq: 2, positions: vec![0, 1] });
        let rare = terms.postings("body", b"rare").unwrap().unwrap();
        assert_eq!(rare.doc_freq(), 1667);
        assert!(rare.docs.windows(2).all(|w| w[1].doc - w[0].doc == 3));

        terms.abort().unwrap();
        assert!(terms.field("body").is_none());
        assert_eq!(counter.get(), 0);
    }
}
