//! Append-only byte pool with a slice allocator.
//!
//! Posting streams for many terms share the blocks of one [`ByteBlockPool`].
//! A stream starts as a 5-byte region; the last byte of every region is a
//! non-zero end marker (`16 | level`) and all bytes before it start out zero.
//! A writer that finds a non-zero byte under its cursor has hit the marker and
//! calls [`ByteBlockPool::alloc_slice`], which:
//!
//! 1. reserves a region of the next level (never split across blocks),
//! 2. moves the last three data bytes of the full region to the new one,
//! 3. writes the new region's absolute address, big-endian, over those three
//!    bytes plus the marker.
//!
//! The last four bytes of every non-final region therefore always hold a
//! forwarding address and never payload, which is what keeps the zero-byte
//! marker check sound.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use crate::error::{IrisError, Result};
use crate::pool::allocator::{BlockAllocator, DirectAllocator};

pub const BYTE_BLOCK_SHIFT: usize = 15;
pub const BYTE_BLOCK_SIZE: usize = 1 << BYTE_BLOCK_SHIFT;
pub const BYTE_BLOCK_MASK: usize = BYTE_BLOCK_SIZE - 1;

/// Level reached when a region of level `i` fills up. The last level repeats.
pub const NEXT_LEVEL_ARRAY: [usize; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 9];

/// Region size in bytes for each level.
pub const LEVEL_SIZE_ARRAY: [usize; 10] = [5, 14, 20, 30, 40, 40, 80, 80, 120, 200];

pub const FIRST_LEVEL_SIZE: usize = LEVEL_SIZE_ARRAY[0];

/// Forwarding addresses are written as 4-byte signed integers.
const MAX_BLOCKS: usize = (i32::MAX as usize + 1) >> BYTE_BLOCK_SHIFT;

/// Terms are stored with a 1 or 2 byte length prefix inside a single block.
pub const MAX_TERM_LENGTH: usize = BYTE_BLOCK_SIZE - 2;

/// Split an absolute pool address into `(block_index, offset_in_block)`.
#[inline]
pub fn split_address(address: usize) -> (usize, usize) {
    (address >> BYTE_BLOCK_SHIFT, address & BYTE_BLOCK_MASK)
}

/// A growable sequence of fixed-size byte blocks.
pub struct ByteBlockPool {
    buffers: Vec<Box<[u8]>>,
    /// Write position inside the head (last) block.
    byte_upto: usize,
    allocator: Box<dyn BlockAllocator<u8>>,
}

impl fmt::Debug for ByteBlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBlockPool")
            .field("num_buffers", &self.buffers.len())
            .field("byte_upto", &self.byte_upto)
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl Default for ByteBlockPool {
    fn default() -> Self {
        Self::new(Box::new(DirectAllocator::new(BYTE_BLOCK_SIZE)))
    }
}

impl ByteBlockPool {
    pub fn new(allocator: Box<dyn BlockAllocator<u8>>) -> Self {
        debug_assert_eq!(allocator.block_size(), BYTE_BLOCK_SIZE);
        ByteBlockPool {
            buffers: Vec::new(),
            byte_upto: BYTE_BLOCK_SIZE,
            allocator,
        }
    }

    /// Grow the pool by one block and make it the head. Returns its index.
    pub fn next_buffer(&mut self) -> Result<usize> {
        if self.buffers.len() >= MAX_BLOCKS {
            return Err(IrisError::capacity(format!(
                "byte pool cannot address more than {MAX_BLOCKS} blocks"
            )));
        }
        self.buffers.push(self.allocator.allocate());
        self.byte_upto = 0;
        Ok(self.buffers.len() - 1)
    }

    /// Index of the head block, if any block has been allocated.
    pub fn buffer_upto(&self) -> Option<usize> {
        self.buffers.len().checked_sub(1)
    }

    /// Write position inside the head block.
    pub fn byte_upto(&self) -> usize {
        self.byte_upto
    }

    /// Absolute address of the first byte of the head block.
    pub fn byte_offset(&self) -> usize {
        self.buffer_upto().map_or(0, |i| i << BYTE_BLOCK_SHIFT)
    }

    /// Absolute address of the next byte that would be handed out.
    pub fn position(&self) -> usize {
        match self.buffer_upto() {
            Some(i) => (i << BYTE_BLOCK_SHIFT) + self.byte_upto,
            None => 0,
        }
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer(&self, index: usize) -> &[u8] {
        &self.buffers[index]
    }

    pub fn buffer_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.buffers[index]
    }

    /// Byte at an absolute address.
    #[inline]
    pub fn byte_at(&self, address: usize) -> u8 {
        let (block, offset) = split_address(address);
        self.buffers[block][offset]
    }

    #[inline]
    pub(crate) fn set_byte(&mut self, address: usize, b: u8) {
        let (block, offset) = split_address(address);
        self.buffers[block][offset] = b;
    }

    /// Reserve the first region of a new slice and return its absolute
    /// address. `level` selects the size class; streams read back through
    /// [`ByteSliceReader`](crate::pool::ByteSliceReader) start at level 0.
    pub fn new_slice(&mut self, level: usize) -> Result<usize> {
        let size = *LEVEL_SIZE_ARRAY.get(level).ok_or_else(|| {
            IrisError::invalid_argument(format!("slice level {level} does not exist"))
        })?;
        if self.buffers.is_empty() || self.byte_upto > BYTE_BLOCK_SIZE - size {
            self.next_buffer()?;
        }
        let upto = self.byte_upto;
        self.byte_upto += size;
        let head = self.buffers.len() - 1;
        self.buffers[head][self.byte_upto - 1] = 16 | level as u8;
        Ok((head << BYTE_BLOCK_SHIFT) + upto)
    }

    /// Grow a slice whose writer reached the end marker at `marker_address`.
    /// Returns the absolute address at which writing continues.
    pub fn alloc_slice(&mut self, marker_address: usize) -> Result<usize> {
        let (block, upto) = split_address(marker_address);
        let level = (self.buffers[block][upto] & 15) as usize;
        debug_assert!(level < NEXT_LEVEL_ARRAY.len(), "corrupt slice end marker");
        let new_level = NEXT_LEVEL_ARRAY[level];
        let new_size = LEVEL_SIZE_ARRAY[new_level];

        // The tail of the current block is abandoned rather than split.
        if self.byte_upto > BYTE_BLOCK_SIZE - new_size {
            self.next_buffer()?;
        }

        let head = self.buffers.len() - 1;
        let new_upto = self.byte_upto;
        let offset = (head << BYTE_BLOCK_SHIFT) + new_upto;
        self.byte_upto += new_size;

        let mut carried = [0u8; 3];
        carried.copy_from_slice(&self.buffers[block][upto - 3..upto]);
        self.buffers[head][new_upto..new_upto + 3].copy_from_slice(&carried);

        BigEndian::write_u32(&mut self.buffers[block][upto - 3..=upto], offset as u32);

        self.buffers[head][self.byte_upto - 1] = 16 | new_level as u8;

        Ok(offset + 3)
    }

    /// Store a term's bytes with a length prefix and return its text start.
    pub fn add_term(&mut self, bytes: &[u8]) -> Result<usize> {
        let len = bytes.len();
        if len > MAX_TERM_LENGTH {
            return Err(IrisError::capacity(format!(
                "term of {len} bytes exceeds the maximum term length of {MAX_TERM_LENGTH}"
            )));
        }
        if self.buffers.is_empty() || len + 2 + self.byte_upto > BYTE_BLOCK_SIZE {
            self.next_buffer()?;
        }
        let head = self.buffers.len() - 1;
        let start = self.byte_upto;
        let buffer = &mut self.buffers[head];
        let data_start = if len < 128 {
            buffer[start] = len as u8;
            start + 1
        } else {
            buffer[start] = 0x80 | (len & 0x7F) as u8;
            buffer[start + 1] = (len >> 7) as u8;
            start + 2
        };
        buffer[data_start..data_start + len].copy_from_slice(bytes);
        self.byte_upto = data_start + len;
        Ok((head << BYTE_BLOCK_SHIFT) + start)
    }

    /// Bytes of a term stored by [`add_term`](Self::add_term).
    pub fn term_at(&self, text_start: usize) -> &[u8] {
        let (block, pos) = split_address(text_start);
        let buffer = &self.buffers[block];
        let (len, offset) = if buffer[pos] & 0x80 == 0 {
            (buffer[pos] as usize, pos + 1)
        } else {
            (
                (buffer[pos] & 0x7F) as usize + ((buffer[pos + 1] as usize) << 7),
                pos + 2,
            )
        };
        &buffer[offset..offset + len]
    }

    /// Append raw bytes, spilling into new blocks as needed. Returns the
    /// absolute address of the first byte.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize> {
        if self.buffers.is_empty() || self.byte_upto == BYTE_BLOCK_SIZE {
            self.next_buffer()?;
        }
        let start = self.position();
        let mut remaining = bytes;
        while !remaining.is_empty() {
            if self.byte_upto == BYTE_BLOCK_SIZE {
                self.next_buffer()?;
            }
            let head = self.buffers.len() - 1;
            let n = remaining.len().min(BYTE_BLOCK_SIZE - self.byte_upto);
            self.buffers[head][self.byte_upto..self.byte_upto + n]
                .copy_from_slice(&remaining[..n]);
            self.byte_upto += n;
            remaining = &remaining[n..];
        }
        Ok(start)
    }

    /// Copy `dst.len()` bytes starting at an absolute address.
    pub fn read_bytes(&self, address: usize, dst: &mut [u8]) {
        let mut address = address;
        let mut filled = 0;
        while filled < dst.len() {
            let (block, offset) = split_address(address);
            let n = (dst.len() - filled).min(BYTE_BLOCK_SIZE - offset);
            dst[filled..filled + n].copy_from_slice(&self.buffers[block][offset..offset + n]);
            filled += n;
            address += n;
        }
    }

    /// Release all blocks. With `reuse_first` the first block is kept as the
    /// head so the next write does not allocate, and `zero_fill_buffers`
    /// clears its used part; that is required before it is handed out again
    /// for slices. Released blocks go back to the allocator untouched.
    pub fn reset(&mut self, zero_fill_buffers: bool, reuse_first: bool) {
        let Some(head) = self.buffer_upto() else {
            return;
        };
        if zero_fill_buffers && reuse_first {
            let used = if head == 0 { self.byte_upto } else { BYTE_BLOCK_SIZE };
            self.buffers[0][..used].fill(0);
        }

        let keep = usize::from(reuse_first);
        if self.buffers.len() > keep {
            let released = self.buffers.split_off(keep);
            self.allocator.recycle(released);
        }

        self.byte_upto = if reuse_first { 0 } else { BYTE_BLOCK_SIZE };
    }
}
