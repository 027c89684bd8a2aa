//! Sequential cursors over a chain of byte slices.
//!
//! [`ByteSliceWriter`] appends to a slice and grows it transparently through
//! [`ByteBlockPool::alloc_slice`]. [`ByteSliceReader`] walks the chain back
//! from a start address to an end address, following the in-band forwarding
//! addresses at region boundaries.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{IrisError, Result};
use crate::pool::byte_block::{
    BYTE_BLOCK_SHIFT, ByteBlockPool, FIRST_LEVEL_SIZE, LEVEL_SIZE_ARRAY, NEXT_LEVEL_ARRAY,
    split_address,
};
use crate::util::varint::{ByteSink, ByteSource};

/// Appends bytes to a slice.
#[derive(Debug)]
pub struct ByteSliceWriter<'a> {
    pool: &'a mut ByteBlockPool,
    address: usize,
}

impl<'a> ByteSliceWriter<'a> {
    /// Position the writer at an absolute address inside a slice, usually the
    /// start of a fresh slice or the address a previous writer stopped at.
    pub fn new(pool: &'a mut ByteBlockPool, address: usize) -> Self {
        ByteSliceWriter { pool, address }
    }

    /// Move the writer to another address in the same pool.
    pub fn init(&mut self, address: usize) {
        self.address = address;
    }

    /// Absolute address of the next write.
    pub fn address(&self) -> usize {
        self.address
    }
}

impl ByteSink for ByteSliceWriter<'_> {
    fn write_byte(&mut self, b: u8) -> Result<()> {
        if self.pool.byte_at(self.address) != 0 {
            // end marker: the region is full
            self.address = self.pool.alloc_slice(self.address)?;
        }
        self.pool.set_byte(self.address, b);
        self.address += 1;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for &b in bytes {
            self.write_byte(b)?;
        }
        Ok(())
    }
}

/// Reads a slice chain written by [`ByteSliceWriter`], starting at level 0.
#[derive(Debug)]
pub struct ByteSliceReader<'a> {
    pool: &'a ByteBlockPool,
    level: usize,
    buffer_upto: usize,
    buffer_offset: usize,
    /// Read position inside the current block.
    upto: usize,
    /// Where the current region's payload ends inside the current block.
    limit: usize,
    end_index: usize,
}

impl<'a> ByteSliceReader<'a> {
    pub fn new(pool: &'a ByteBlockPool, start_index: usize, end_index: usize) -> Result<Self> {
        let mut reader = ByteSliceReader {
            pool,
            level: 0,
            buffer_upto: 0,
            buffer_offset: 0,
            upto: 0,
            limit: 0,
            end_index: 0,
        };
        reader.init(start_index, end_index)?;
        Ok(reader)
    }

    /// Reposition the reader over another slice of the same pool.
    pub fn init(&mut self, start_index: usize, end_index: usize) -> Result<()> {
        if end_index < start_index {
            return Err(IrisError::out_of_range(format!(
                "slice end {end_index} precedes start {start_index}"
            )));
        }
        if end_index > self.pool.position() {
            return Err(IrisError::out_of_range(format!(
                "slice end {end_index} is beyond the pool position {}",
                self.pool.position()
            )));
        }

        self.end_index = end_index;
        self.level = 0;
        let (block, upto) = split_address(start_index);
        self.buffer_upto = block;
        self.buffer_offset = block << BYTE_BLOCK_SHIFT;
        self.upto = upto;

        self.limit = if start_index + FIRST_LEVEL_SIZE >= end_index {
            // the whole slice lives in its first region
            end_index - self.buffer_offset
        } else {
            self.upto + FIRST_LEVEL_SIZE - 4
        };
        Ok(())
    }

    /// True once every byte up to the end address has been consumed.
    pub fn eof(&self) -> bool {
        debug_assert!(self.upto + self.buffer_offset <= self.end_index);
        self.upto + self.buffer_offset == self.end_index
    }

    fn next_slice(&mut self) {
        let buffer = self.pool.buffer(self.buffer_upto);
        let next_index = BigEndian::read_u32(&buffer[self.limit..self.limit + 4]) as usize;

        self.level = NEXT_LEVEL_ARRAY[self.level];
        let new_size = LEVEL_SIZE_ARRAY[self.level];

        let (block, upto) = split_address(next_index);
        self.buffer_upto = block;
        self.buffer_offset = block << BYTE_BLOCK_SHIFT;
        self.upto = upto;

        self.limit = if next_index + new_size >= self.end_index {
            self.end_index - self.buffer_offset
        } else {
            self.upto + new_size - 4
        };
    }

    /// Fill `dst` completely from the slice.
    pub fn read_bytes(&mut self, dst: &mut [u8]) {
        let mut filled = 0;
        while filled < dst.len() {
            if self.upto == self.limit {
                assert!(!self.eof(), "read past the end of a byte slice");
                self.next_slice();
            }
            let available = self.limit - self.upto;
            let n = available.min(dst.len() - filled);
            let buffer = self.pool.buffer(self.buffer_upto);
            dst[filled..filled + n].copy_from_slice(&buffer[self.upto..self.upto + n]);
            self.upto += n;
            filled += n;
        }
    }

    /// Copy the rest of the slice into `out`, one region at a time. Returns
    /// the number of bytes written.
    pub fn write_to<S: ByteSink + ?Sized>(&mut self, out: &mut S) -> Result<usize> {
        let mut size = 0;
        loop {
            let buffer = self.pool.buffer(self.buffer_upto);
            out.write_bytes(&buffer[self.upto..self.limit])?;
            size += self.limit - self.upto;
            self.upto = self.limit;
            if self.limit + self.buffer_offset == self.end_index {
                break;
            }
            self.next_slice();
        }
        Ok(size)
    }
}

impl ByteSource for ByteSliceReader<'_> {
    fn read_byte(&mut self) -> u8 {
        assert!(!self.eof(), "read past the end of a byte slice");
        if self.upto == self.limit {
            self.next_slice();
        }
        let b = self.pool.buffer(self.buffer_upto)[self.upto];
        self.upto += 1;
        b
    }
}
