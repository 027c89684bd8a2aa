//! # Iris Indexer
//!
//! The in-memory indexing core of the Iris full-text search engine.
//!
//! ## Features
//!
//! - Slice pools: growable per-term byte streams packed into fixed-size blocks
//! - Concurrent indexing through per-thread document buffers
//! - RAM, document-count and delete-count flush triggers with a stall gate
//! - Buffered deletes and doc-value updates replayed onto flushed segments
//! - Composite readers over any number of segments
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use iris_indexer::{Document, DocumentsWriter, IndexWriterConfig, MemorySegmentStore, Term};
//!
//! let store = Arc::new(MemorySegmentStore::new());
//! let writer = DocumentsWriter::new(IndexWriterConfig::default(), store)?;
//! let doc = Document::builder()
//!     .add_keyword("id", "1")
//!     .add_tokens("body", ["hello", "world"])
//!     .build();
//! writer.add_document(&doc)?;
//! writer.flush_all_threads()?;
//!
//! let reader = writer.open_reader()?;
//! assert_eq!(reader.doc_freq(&Term::new("body", "hello"))?, Some(1));
//! # Ok::<(), iris_indexer::IrisError>(())
//! ```

pub mod document;
mod error;
pub mod index;
pub mod pool;
pub mod reader;
pub mod util;

// Re-exports for the public API
pub use document::{DocId, Document, Field, FieldValue, IndexOptions, StoredValue, Term, Token};
pub use error::{IrisError, Result};
pub use index::{DocumentsWriter, IndexWriterConfig, MemorySegmentStore, MergeSchedulerKind};
pub use reader::{BaseCompositeReader, LeafReader, ReaderContext};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
