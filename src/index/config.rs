//! Configuration for the documents writer.

use serde::{Deserialize, Serialize};

use crate::error::{IrisError, Result};

/// Which merge scheduler the writer builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergeSchedulerKind {
    /// Never merge.
    #[default]
    None,
    /// Merge one at a time on the thread that triggered the merge.
    Serial,
}

/// Indexing writer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexWriterConfig {
    /// RAM buffer (in MB) across all thread states before the largest one is
    /// flushed. `None` disables flushing by RAM.
    pub ram_buffer_size_mb: Option<f64>,

    /// Buffered documents per thread state before it is flushed. `None`
    /// disables flushing by document count.
    pub max_buffered_docs: Option<usize>,

    /// Buffered delete terms before all pending deletes are applied.
    pub max_buffered_delete_terms: Option<usize>,

    /// Hard RAM limit (in MB) of a single thread state.
    pub ram_per_thread_hard_limit_mb: usize,

    /// Maximum number of concurrently indexing thread states.
    pub max_thread_states: usize,

    pub merge_scheduler: MergeSchedulerKind,

    /// Prefix of generated segment names.
    pub segment_prefix: String,
}

impl Default for IndexWriterConfig {
    fn default() -> Self {
        IndexWriterConfig {
            ram_buffer_size_mb: Some(16.0),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            ram_per_thread_hard_limit_mb: 1945,
            max_thread_states: num_cpus::get().clamp(1, 8),
            merge_scheduler: MergeSchedulerKind::None,
            segment_prefix: "_".to_string(),
        }
    }
}

impl IndexWriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ram_buffer_size_mb(mut self, mb: Option<f64>) -> Self {
        self.ram_buffer_size_mb = mb;
        self
    }

    pub fn with_max_buffered_docs(mut self, docs: Option<usize>) -> Self {
        self.max_buffered_docs = docs;
        self
    }

    pub fn with_max_buffered_delete_terms(mut self, terms: Option<usize>) -> Self {
        self.max_buffered_delete_terms = terms;
        self
    }

    pub fn with_ram_per_thread_hard_limit_mb(mut self, mb: usize) -> Self {
        self.ram_per_thread_hard_limit_mb = mb;
        self
    }

    pub fn with_max_thread_states(mut self, states: usize) -> Self {
        self.max_thread_states = states;
        self
    }

    pub fn with_merge_scheduler(mut self, kind: MergeSchedulerKind) -> Self {
        self.merge_scheduler = kind;
        self
    }

    pub fn with_segment_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.segment_prefix = prefix.into();
        self
    }

    /// RAM buffer in bytes, if flushing by RAM is enabled.
    pub fn ram_buffer_bytes(&self) -> Option<u64> {
        self.ram_buffer_size_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as u64)
    }

    pub fn per_thread_hard_limit_bytes(&self) -> u64 {
        self.ram_per_thread_hard_limit_mb as u64 * 1024 * 1024
    }

    pub fn flush_on_ram(&self) -> bool {
        self.ram_buffer_size_mb.is_some()
    }

    pub fn flush_on_doc_count(&self) -> bool {
        self.max_buffered_docs.is_some()
    }

    pub fn flush_on_delete_terms(&self) -> bool {
        self.max_buffered_delete_terms.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(mb) = self.ram_buffer_size_mb {
            if mb <= 0.0 || !mb.is_finite() {
                return Err(IrisError::invalid_argument(format!(
                    "ram_buffer_size_mb must be positive, got {mb}"
                )));
            }
        }
        if self.max_buffered_docs == Some(0) {
            return Err(IrisError::invalid_argument("max_buffered_docs must be at least 1"));
        }
        if self.max_buffered_delete_terms == Some(0) {
            return Err(IrisError::invalid_argument(
                "max_buffered_delete_terms must be at least 1",
            ));
        }
        if self.ram_buffer_size_mb.is_none() && self.max_buffered_docs.is_none() {
            return Err(IrisError::invalid_argument(
                "at least one of ram_buffer_size_mb and max_buffered_docs must be enabled",
            ));
        }
        if self.ram_per_thread_hard_limit_mb == 0 || self.ram_per_thread_hard_limit_mb >= 2048 {
            return Err(IrisError::invalid_argument(format!(
                "ram_per_thread_hard_limit_mb must be in 1..2048, got {}",
                self.ram_per_thread_hard_limit_mb
            )));
        }
        if self.max_thread_states == 0 {
            return Err(IrisError::invalid_argument("max_thread_states must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndexWriterConfig::default();
        assert_eq!(config.ram_buffer_size_mb, Some(16.0));
        assert_eq!(config.ram_buffer_bytes(), Some(16 * 1024 * 1024));
        assert_eq!(config.ram_per_thread_hard_limit_mb, 1945);
        assert!((1..=8).contains(&config.max_thread_states));
        assert_eq!(config.merge_scheduler, MergeSchedulerKind::None);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_disabled_triggers() {
        let config = IndexWriterConfig::default().with_ram_buffer_size_mb(None);
        assert!(config.validate().is_err());
        assert!(
            config
                .with_max_buffered_docs(Some(10))
                .validate()
                .is_ok()
        );
        assert!(
            IndexWriterConfig::default()
                .with_ram_buffer_size_mb(Some(0.0))
                .validate()
                .is_err()
        );
        assert!(
            IndexWriterConfig::default()
                .with_max_thread_states(0)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_serde_fills_missing_fields() {
        let config: IndexWriterConfig =
            serde_json::from_str(r#"{"max_buffered_docs": 1000, "merge_scheduler": "Serial"}"#)
                .unwrap();
        assert_eq!(config.max_buffered_docs, Some(1000));
        assert_eq!(config.merge_scheduler, MergeSchedulerKind::Serial);
        assert_eq!(config.ram_buffer_size_mb, Some(16.0));
    }
}
