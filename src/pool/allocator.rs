//! Block allocators for the byte and int pools.

use std::fmt;

use crate::util::counter::Counter;

/// Supplies fixed-size, zero-filled blocks to a pool and takes them back on
/// reset.
pub trait BlockAllocator<T>: Send + fmt::Debug {
    /// Number of elements in every block this allocator hands out.
    fn block_size(&self) -> usize;

    /// Allocate one zero-filled block.
    fn allocate(&mut self) -> Box<[T]>;

    /// Take back blocks the pool no longer references.
    fn recycle(&mut self, blocks: Vec<Box<[T]>>);
}

/// Allocates straight from the heap and drops recycled blocks.
#[derive(Debug, Clone)]
pub struct DirectAllocator {
    block_size: usize,
}

impl DirectAllocator {
    pub fn new(block_size: usize) -> Self {
        DirectAllocator { block_size }
    }
}

impl<T: Copy + Default> BlockAllocator<T> for DirectAllocator {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&mut self) -> Box<[T]> {
        vec![T::default(); self.block_size].into_boxed_slice()
    }

    fn recycle(&mut self, blocks: Vec<Box<[T]>>) {
        drop(blocks);
    }
}

/// Like [`DirectAllocator`], but reports every allocated and recycled byte to
/// a shared [`Counter`].
#[derive(Debug, Clone)]
pub struct TrackingAllocator {
    block_size: usize,
    bytes_used: Counter,
}

impl TrackingAllocator {
    pub fn new(block_size: usize, bytes_used: Counter) -> Self {
        TrackingAllocator {
            block_size,
            bytes_used,
        }
    }

    pub fn bytes_used(&self) -> &Counter {
        &self.bytes_used
    }
}

impl<T: Copy + Default> BlockAllocator<T> for TrackingAllocator {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn allocate(&mut self) -> Box<[T]> {
        self.bytes_used
            .add_and_get((self.block_size * std::mem::size_of::<T>()) as i64);
        vec![T::default(); self.block_size].into_boxed_slice()
    }

    fn recycle(&mut self, blocks: Vec<Box<[T]>>) {
        let freed = blocks.len() * self.block_size * std::mem::size_of::<T>();
        self.bytes_used.add_and_get(-(freed as i64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_allocator_accounts_bytes() {
        let counter = Counter::new();
        let mut alloc = TrackingAllocator::new(16, counter.clone());

        let a: Box<[u8]> = alloc.allocate();
        let b: Box<[u8]> = alloc.allocate();
        assert_eq!(counter.get(), 32);
        assert!(a.iter().all(|&x| x == 0));

        BlockAllocator::<u8>::recycle(&mut alloc, vec![a, b]);
        assert_eq!(counter.get(), 0);

        let ints: Box<[u32]> = alloc.allocate();
        assert_eq!(ints.len(), 16);
        assert_eq!(counter.get(), 64);
    }
}
