//! Read side of the index: leaf readers, composites and their context tree.
//!
//! # Module Structure
//!
//! - `registry`: reader identity, parent registration and close listeners
//! - `leaf`: the [`LeafReader`] capability and stored-field visitors
//! - `composite`: a reader stitched together from sub-readers
//! - `context`: the navigation tree over a reader hierarchy
//! - `memory`: a leaf reader over an in-memory segment
//!
//! A composite reader presents its sub-readers as one contiguous document
//! id space. Sub-reader `i` owns the global ids `starts[i]..starts[i + 1]`.

pub mod composite;
pub mod context;
pub mod leaf;
pub mod memory;
pub mod registry;

pub use composite::{BaseCompositeReader, IndexReaderRef, ReaderSlice};
pub use context::{CompositeReaderContext, LeafReaderContext, ReaderContext};
pub use leaf::{
    DocumentStoredFieldVisitor, LeafReader, StoredFieldVisitor, TermVectorEntry, TermVectors,
    VisitStatus,
};
pub use memory::MemoryLeafReader;
pub use registry::{ClosedListener, ReaderCore, ReaderId};
