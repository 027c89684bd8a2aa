//! Append-only int pool.
//!
//! The terms hash keeps one int per posting stream here: the absolute byte
//! address at which the stream's next byte is written. The pool also supports
//! int slices, which work like byte slices except that the forwarding address
//! replaces the end marker slot itself.

use std::fmt;

use crate::error::{IrisError, Result};
use crate::pool::allocator::{BlockAllocator, DirectAllocator};

pub const INT_BLOCK_SHIFT: usize = 13;
pub const INT_BLOCK_SIZE: usize = 1 << INT_BLOCK_SHIFT;
pub const INT_BLOCK_MASK: usize = INT_BLOCK_SIZE - 1;

const INT_NEXT_LEVEL_ARRAY: [usize; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 9];
const INT_LEVEL_SIZE_ARRAY: [usize; 10] = [2, 4, 8, 16, 32, 64, 128, 256, 512, 1024];
const INT_FIRST_LEVEL_SIZE: usize = INT_LEVEL_SIZE_ARRAY[0];

const MAX_INT_BLOCKS: usize = (i32::MAX as usize + 1) >> INT_BLOCK_SHIFT;

#[inline]
fn split(address: usize) -> (usize, usize) {
    (address >> INT_BLOCK_SHIFT, address & INT_BLOCK_MASK)
}

/// A growable sequence of fixed-size `u32` blocks.
pub struct IntBlockPool {
    buffers: Vec<Box<[u32]>>,
    int_upto: usize,
    allocator: Box<dyn BlockAllocator<u32>>,
}

impl fmt::Debug for IntBlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntBlockPool")
            .field("num_buffers", &self.buffers.len())
            .field("int_upto", &self.int_upto)
            .finish()
    }
}

impl Default for IntBlockPool {
    fn default() -> Self {
        Self::new(Box::new(DirectAllocator::new(INT_BLOCK_SIZE)))
    }
}

impl IntBlockPool {
    pub fn new(allocator: Box<dyn BlockAllocator<u32>>) -> Self {
        debug_assert_eq!(allocator.block_size(), INT_BLOCK_SIZE);
        IntBlockPool {
            buffers: Vec::new(),
            int_upto: INT_BLOCK_SIZE,
            allocator,
        }
    }

    pub fn next_buffer(&mut self) -> Result<usize> {
        if self.buffers.len() >= MAX_INT_BLOCKS {
            return Err(IrisError::capacity(format!(
                "int pool cannot address more than {MAX_INT_BLOCKS} blocks"
            )));
        }
        self.buffers.push(self.allocator.allocate());
        self.int_upto = 0;
        Ok(self.buffers.len() - 1)
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    /// Reserve `count` consecutive ints inside one block and return the
    /// absolute address of the first.
    pub fn reserve(&mut self, count: usize) -> Result<usize> {
        if count > INT_BLOCK_SIZE {
            return Err(IrisError::invalid_argument(format!(
                "cannot reserve {count} ints in blocks of {INT_BLOCK_SIZE}"
            )));
        }
        if self.buffers.is_empty() || self.int_upto + count > INT_BLOCK_SIZE {
            self.next_buffer()?;
        }
        let start = ((self.buffers.len() - 1) << INT_BLOCK_SHIFT) + self.int_upto;
        self.int_upto += count;
        Ok(start)
    }

    #[inline]
    pub fn get(&self, address: usize) -> u32 {
        let (block, offset) = split(address);
        self.buffers[block][offset]
    }

    #[inline]
    pub fn set(&mut self, address: usize, value: u32) {
        let (block, offset) = split(address);
        self.buffers[block][offset] = value;
    }

    /// Reserve the first region of a new int slice.
    pub fn new_slice(&mut self) -> Result<usize> {
        let start = self.reserve(INT_FIRST_LEVEL_SIZE)?;
        // markers store level + 1 so that they are never zero
        self.set(start + INT_FIRST_LEVEL_SIZE - 1, 1);
        Ok(start)
    }

    /// Grow an int slice whose writer reached the marker at `marker_address`.
    /// Returns the absolute address at which writing continues.
    fn alloc_slice(&mut self, marker_address: usize) -> Result<usize> {
        let level = self.get(marker_address) as usize - 1;
        let new_level = INT_NEXT_LEVEL_ARRAY[level];
        let new_size = INT_LEVEL_SIZE_ARRAY[new_level];

        let start = self.reserve(new_size)?;
        self.set(marker_address, start as u32);
        self.set(start + new_size - 1, new_level as u32 + 1);
        Ok(start)
    }

    /// Release all blocks, optionally clearing them and keeping the first.
    pub fn reset(&mut self, zero_fill_buffers: bool, reuse_first: bool) {
        let Some(head) = self.buffers.len().checked_sub(1) else {
            return;
        };
        if zero_fill_buffers && reuse_first {
            let used = if head == 0 { self.int_upto } else { INT_BLOCK_SIZE };
            self.buffers[0][..used].fill(0);
        }

        let keep = usize::from(reuse_first);
        if self.buffers.len() > keep {
            let released = self.buffers.split_off(keep);
            self.allocator.recycle(released);
        }
        self.int_upto = if reuse_first { 0 } else { INT_BLOCK_SIZE };
    }
}

/// Sequential writer over an int slice.
#[derive(Debug)]
pub struct IntSliceWriter<'a> {
    pool: &'a mut IntBlockPool,
    address: usize,
}

impl<'a> IntSliceWriter<'a> {
    /// Start a fresh slice.
    pub fn start_new(pool: &'a mut IntBlockPool) -> Result<(Self, usize)> {
        let start = pool.new_slice()?;
        Ok((
            IntSliceWriter {
                pool,
                address: start,
            },
            start,
        ))
    }

    /// Resume writing an existing slice at `address`.
    pub fn resume(pool: &'a mut IntBlockPool, address: usize) -> Self {
        IntSliceWriter { pool, address }
    }

    pub fn write_int(&mut self, value: u32) -> Result<()> {
        if self.pool.get(self.address) != 0 {
            self.address = self.pool.alloc_slice(self.address)?;
        }
        self.pool.set(self.address, value);
        self.address += 1;
        Ok(())
    }

    /// Absolute address of the next write; pass it as `end` to a reader.
    pub fn address(&self) -> usize {
        self.address
    }
}

/// Sequential reader over an int slice written by [`IntSliceWriter`].
#[derive(Debug)]
pub struct IntSliceReader<'a> {
    pool: &'a IntBlockPool,
    upto: usize,
    limit: usize,
    level: usize,
    end: usize,
}

impl<'a> IntSliceReader<'a> {
    pub fn new(pool: &'a IntBlockPool, start: usize, end: usize) -> Result<Self> {
        if end < start {
            return Err(IrisError::out_of_range(format!(
                "int slice end {end} precedes start {start}"
            )));
        }
        let limit = if start + INT_FIRST_LEVEL_SIZE >= end {
            end
        } else {
            start + INT_FIRST_LEVEL_SIZE - 1
        };
        Ok(IntSliceReader {
            pool,
            upto: start,
            limit,
            level: 0,
            end,
        })
    }

    pub fn eof(&self) -> bool {
        self.upto == self.end
    }

    pub fn read_int(&mut self) -> u32 {
        assert!(!self.eof(), "read past the end of an int slice");
        if self.upto == self.limit {
            self.next_slice();
        }
        let value = self.pool.get(self.upto);
        self.upto += 1;
        value
    }

    fn next_slice(&mut self) {
        let next = self.pool.get(self.limit) as usize;
        self.level = INT_NEXT_LEVEL_ARRAY[self.level];
        let size = INT_LEVEL_SIZE_ARRAY[self.level];
        self.upto = next;
        self.limit = if next + size >= self.end {
            self.end
        } else {
            next + size - 1
        };
    }
}
