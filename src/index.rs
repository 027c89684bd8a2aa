//! Write side of the index: buffering documents and turning them into
//! segments.
//!
//! # Module Structure
//!
//! - `config`: writer configuration
//! - `thread_pool`: thread states, each owning one per-thread buffer
//! - `stall`: blocks indexing threads while flushing falls behind
//! - `flush_policy`: decides which thread state flushes next
//! - `flush_control`: RAM accounting, checkout of flushing buffers, full flush
//! - `field_infos`: per-segment field metadata
//! - `bytes_hash`, `terms_hash`: term dictionary and posting streams
//! - `norms`, `doc_values`, `stored`: the other per-field stages
//! - `chain`: the ordered list of field stages
//! - `sink`, `segment`: where flushed segments go, and the in-memory store
//! - `updates`: buffered deletes and doc-value updates
//! - `per_thread`: one thread's buffer of documents
//! - `merge_scheduler`: how merges are run
//! - `writer`: the multi-threaded entry point

pub mod bytes_hash;
pub mod chain;
pub mod config;
pub mod doc_values;
pub mod field_infos;
pub mod flush_control;
pub mod flush_policy;
pub mod merge_scheduler;
pub mod norms;
pub mod per_thread;
pub mod segment;
pub mod sink;
pub mod stall;
pub mod stored;
pub mod terms_hash;
pub mod thread_pool;
pub mod updates;
pub mod writer;

pub use chain::{FieldConsumer, FieldStage, FlushContext, IndexingChain};
pub use config::{IndexWriterConfig, MergeSchedulerKind};
pub use field_infos::{DocValuesType, FieldInfo, FieldInfos};
pub use flush_control::{FlushControl, FlushStats};
pub use flush_policy::{FlushByRamOrCountsPolicy, FlushDecisions, FlushPolicy, ThreadStateStats};
pub use merge_scheduler::{
    MergeScheduler, MergeSource, MergeTrigger, NoMergeScheduler, OneMerge, SerialMergeScheduler,
};
pub use per_thread::{DocumentsWriterPerThread, FlushedSegment};
pub use segment::{MemorySegmentStore, SegmentData};
pub use sink::{DocPosting, SegmentStore, SegmentSummary, SegmentWriteSink, TermPostings};
pub use stall::StallControl;
pub use thread_pool::{LockedThreadState, PerThreadBuffer, ThreadState, ThreadStatePool};
pub use updates::{
    BufferedUpdates, BufferedUpdatesStream, CoalescedUpdates, DeleteQuery, FrozenBufferedUpdates,
    SegmentUpdates, TermQuery,
};
pub use writer::{DocumentsWriter, SegmentEntry};
