//! Hash from term bytes to dense term ids.
//!
//! Term bytes live in a [`ByteBlockPool`] owned by the caller; the hash only
//! keeps each term's text start, so several fields can share one pool. Ids
//! are assigned densely from 0 in insertion order.

use ahash::RandomState;

use crate::error::{IrisError, Result};
use crate::pool::ByteBlockPool;
use crate::util::counter::Counter;

const EMPTY: u32 = u32::MAX;
const DEFAULT_CAPACITY: usize = 16;

/// Bytes accounted per table slot and per term.
const BYTES_PER_SLOT: i64 = 4;
const BYTES_PER_TERM: i64 = 8 + 8;

/// Outcome of [`BytesRefHash::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSlot {
    New(usize),
    Existing(usize),
}

impl TermSlot {
    pub fn id(self) -> usize {
        match self {
            TermSlot::New(id) | TermSlot::Existing(id) => id,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, TermSlot::New(_))
    }
}

#[derive(Debug)]
pub struct BytesRefHash {
    table: Vec<u32>,
    mask: usize,
    text_starts: Vec<usize>,
    hashes: Vec<u64>,
    state: RandomState,
    bytes_used: Counter,
}

impl BytesRefHash {
    pub fn new(bytes_used: Counter) -> Self {
        bytes_used.add_and_get(DEFAULT_CAPACITY as i64 * BYTES_PER_SLOT);
        BytesRefHash {
            table: vec![EMPTY; DEFAULT_CAPACITY],
            mask: DEFAULT_CAPACITY - 1,
            text_starts: Vec::new(),
            hashes: Vec::new(),
            state: RandomState::new(),
            bytes_used,
        }
    }

    pub fn len(&self) -> usize {
        self.text_starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text_starts.is_empty()
    }

    /// Bytes of the term with id `id`.
    pub fn get<'p>(&self, pool: &'p ByteBlockPool, id: usize) -> &'p [u8] {
        pool.term_at(self.text_starts[id])
    }

    pub fn text_start(&self, id: usize) -> usize {
        self.text_starts[id]
    }

    /// Id of `bytes`, if present.
    pub fn find(&self, pool: &ByteBlockPool, bytes: &[u8]) -> Option<usize> {
        let hash = self.state.hash_one(bytes);
        let slot = self.probe(pool, bytes, hash);
        match self.table[slot] {
            EMPTY => None,
            id => Some(id as usize),
        }
    }

    /// Insert `bytes` unless already present.
    pub fn add(&mut self, pool: &mut ByteBlockPool, bytes: &[u8]) -> Result<TermSlot> {
        let hash = self.state.hash_one(bytes);
        let slot = self.probe(pool, bytes, hash);
        if self.table[slot] != EMPTY {
            return Ok(TermSlot::Existing(self.table[slot] as usize));
        }

        let id = self.text_starts.len();
        if id >= EMPTY as usize {
            return Err(IrisError::capacity("too many distinct terms in one field"));
        }
        let text_start = pool.add_term(bytes)?;
        self.text_starts.push(text_start);
        self.hashes.push(hash);
        self.table[slot] = id as u32;
        self.bytes_used.add_and_get(BYTES_PER_TERM);

        if self.text_starts.len() * 2 > self.table.len() {
            self.rehash(self.table.len() * 2);
        }
        Ok(TermSlot::New(id))
    }

    fn probe(&self, pool: &ByteBlockPool, bytes: &[u8], hash: u64) -> usize {
        let mut slot = hash as usize & self.mask;
        let mut step = 0;
        loop {
            let id = self.table[slot];
            if id == EMPTY {
                return slot;
            }
            let id = id as usize;
            if self.hashes[id] == hash && pool.term_at(self.text_starts[id]) == bytes {
                return slot;
            }
            step += 1;
            slot = (slot + step) & self.mask;
        }
    }

    fn rehash(&mut self, capacity: usize) {
        self.bytes_used
            .add_and_get((capacity as i64 - self.table.len() as i64) * BYTES_PER_SLOT);
        let mut table = vec![EMPTY; capacity];
        let mask = capacity - 1;
        for (id, &hash) in self.hashes.iter().enumerate() {
            let mut slot = hash as usize & mask;
            let mut step = 0;
            while table[slot] != EMPTY {
                step += 1;
                slot = (slot + step) & mask;
            }
            table[slot] = id as u32;
        }
        self.table = table;
        self.mask = mask;
    }

    /// Term ids ordered by their bytes.
    pub fn sort(&self, pool: &ByteBlockPool) -> Vec<usize> {
        let mut ids: Vec<usize> = (0..self.len()).collect();
        ids.sort_unstable_by(|&a, &b| self.get(pool, a).cmp(self.get(pool, b)));
        ids
    }

    /// Forget every term. The pool holding the bytes is reset by its owner.
    pub fn clear(&mut self) {
        let released = self.text_starts.len() as i64 * BYTES_PER_TERM
            + (self.table.len() as i64 - DEFAULT_CAPACITY as i64) * BYTES_PER_SLOT;
        self.bytes_used.add_and_get(-released);
        self.table = vec![EMPTY; DEFAULT_CAPACITY];
        self.mask = DEFAULT_CAPACITY - 1;
        self.text_starts.clear();
        self.hashes.clear();
    }
}

impl Drop for BytesRefHash {
    fn drop(&mut self) {
        let held = self.text_starts.len() as i64 * BYTES_PER_TERM
            + self.table.len() as i64 * BYTES_PER_SLOT;
        self.bytes_used.add_and_get(-held);
    }
}
