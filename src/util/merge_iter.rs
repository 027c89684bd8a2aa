//! K-way merge over individually sorted sources.
//!
//! [`MergeIterator`] keeps one cursor per source and a min-heap of the current
//! head of each cursor. Nothing is materialized up front: every call to `next`
//! pops one head and refills it from the source it came from.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct HeadEntry<T> {
    item: T,
    source: usize,
}

impl<T: Ord> PartialEq for HeadEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for HeadEntry<T> {}

impl<T: Ord> PartialOrd for HeadEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for HeadEntry<T> {
    // BinaryHeap is a max-heap, so both keys are reversed. Equal items come out
    // in source order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.item
            .cmp(&other.item)
            .then(self.source.cmp(&other.source))
            .reverse()
    }
}

/// Lazily merges `K` sorted iterators into one sorted iterator.
///
/// Duplicates are preserved. The output is only sorted if every source is.
pub struct MergeIterator<I: Iterator> {
    sources: Vec<I>,
    heads: BinaryHeap<HeadEntry<I::Item>>,
}

impl<I> MergeIterator<I>
where
    I: Iterator,
    I::Item: Ord,
{
    pub fn new<S: IntoIterator<Item = I>>(sources: S) -> Self {
        let mut sources: Vec<I> = sources.into_iter().collect();
        let mut heads = BinaryHeap::with_capacity(sources.len());
        for (source, iter) in sources.iter_mut().enumerate() {
            if let Some(item) = iter.next() {
                heads.push(HeadEntry { item, source });
            }
        }
        MergeIterator { sources, heads }
    }

    /// Number of sources that still have items.
    pub fn live_sources(&self) -> usize {
        self.heads.len()
    }
}

impl<I> Iterator for MergeIterator<I>
where
    I: Iterator,
    I::Item: Ord,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let HeadEntry { item, source } = self.heads.pop()?;
        if let Some(next) = self.sources[source].next() {
            debug_assert!(next >= item, "merge source {source} is not sorted");
            self.heads.push(HeadEntry { item: next, source });
        }
        Some(item)
    }
}
