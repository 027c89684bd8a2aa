//! Block pools and slice cursors backing the in-memory postings.
//!
//! # Module Structure
//!
//! - `allocator`: where pool blocks come from and how they are accounted
//! - `byte_block`: the byte pool and its slice allocator
//! - `int_block`: the int pool, used for per-term stream addresses
//! - `slice`: sequential writer and reader over a chain of byte slices
//!
//! A slice is a singly linked chain of regions inside one pool. Each region
//! belongs to a size class ("level"); when a writer reaches the end marker of
//! its region, the pool reserves a region of the next level and writes an
//! in-band forwarding address into the tail of the exhausted one. Addresses
//! are absolute: `block_index * block_size + offset_in_block`.

pub mod allocator;
pub mod byte_block;
pub mod int_block;
pub mod slice;

pub use allocator::{BlockAllocator, DirectAllocator, TrackingAllocator};
pub use byte_block::{
    BYTE_BLOCK_MASK, BYTE_BLOCK_SHIFT, BYTE_BLOCK_SIZE, ByteBlockPool, FIRST_LEVEL_SIZE,
    LEVEL_SIZE_ARRAY, NEXT_LEVEL_ARRAY,
};
pub use int_block::{INT_BLOCK_SIZE, IntBlockPool, IntSliceReader, IntSliceWriter};
pub use slice::{ByteSliceReader, ByteSliceWriter};
