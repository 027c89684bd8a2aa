//! Shared utility modules used across the indexing core.

pub mod counter;
pub mod merge_iter;
pub mod varint;
