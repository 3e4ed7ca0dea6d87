use std::fmt;
use std::sync::Arc;

use crate::analysis::Analyzer;
use crate::error::{SearchError, SearchResult};
use crate::index::deletion_policy::{DeletionPolicy, KeepOnlyLastCommit};
use crate::index::merge_policy::{LogByteSizeMergePolicy, MergePolicy};
use crate::index::merge_scheduler::{ConcurrentMergeScheduler, MergeScheduler};
use crate::search::similarity::{DefaultSimilarity, Similarity};

/// Manifest bootstrap strategy for a new writer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Truncate: start a fresh manifest even if one exists.
    Create,
    /// Require an existing manifest.
    Append,
    /// Append if present, create otherwise.
    CreateOrAppend,
}

pub const DEFAULT_TERM_INDEX_INTERVAL: u32 = 128;
pub const DEFAULT_RAM_BUFFER_SIZE_MB: f64 = 16.0;
pub const DEFAULT_MAX_THREAD_STATES: usize = 8;
pub const DEFAULT_WRITE_LOCK_TIMEOUT_MS: u64 = 1000;

/// All knobs of an [`crate::index::IndexWriter`], owned and cloneable.
/// Setter contracts hold by construction: the flush triggers can never both
/// be disabled.
#[derive(Clone)]
pub struct IndexWriterConfig {
    pub open_mode: OpenMode,
    pub analyzer: Arc<dyn Analyzer>,
    pub similarity: Arc<dyn Similarity>,
    pub term_index_interval: u32,
    /// Flush when buffered state reaches this many megabytes; `None`
    /// disables the RAM trigger.
    pub ram_buffer_size_mb: Option<f64>,
    /// Flush when this many documents are buffered; `None` disables.
    pub max_buffered_docs: Option<u32>,
    /// Flush deletes when this many terms are buffered; `None` disables.
    pub max_buffered_delete_terms: Option<u32>,
    pub max_thread_states: usize,
    pub write_lock_timeout_ms: u64,
    /// Keep segment readers pooled inside the writer across commits.
    pub reader_pooling: bool,
    /// Subsample the in-memory term index by this divisor; `-1` skips
    /// loading it entirely (readers then scan from the dictionary start).
    pub reader_terms_index_divisor: i32,
    pub merge_policy: Arc<dyn MergePolicy>,
    pub merge_scheduler: Arc<dyn MergeScheduler>,
    pub deletion_policy: Arc<dyn DeletionPolicy>,
}

impl IndexWriterConfig {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            open_mode: OpenMode::CreateOrAppend,
            analyzer,
            similarity: Arc::new(DefaultSimilarity::default()),
            term_index_interval: DEFAULT_TERM_INDEX_INTERVAL,
            ram_buffer_size_mb: Some(DEFAULT_RAM_BUFFER_SIZE_MB),
            max_buffered_docs: None,
            max_buffered_delete_terms: None,
            max_thread_states: DEFAULT_MAX_THREAD_STATES,
            write_lock_timeout_ms: DEFAULT_WRITE_LOCK_TIMEOUT_MS,
            reader_pooling: false,
            reader_terms_index_divisor: 1,
            merge_policy: Arc::new(LogByteSizeMergePolicy::default()),
            merge_scheduler: Arc::new(ConcurrentMergeScheduler::default()),
            deletion_policy: Arc::new(KeepOnlyLastCommit),
        }
    }

    pub fn open_mode(mut self, mode: OpenMode) -> Self {
        self.open_mode = mode;
        self
    }

    pub fn similarity(mut self, similarity: Arc<dyn Similarity>) -> Self {
        self.similarity = similarity;
        self
    }

    pub fn term_index_interval(mut self, interval: u32) -> SearchResult<Self> {
        if interval == 0 {
            return Err(SearchError::IllegalArgument(
                "term_index_interval must be positive".to_string(),
            ));
        }
        self.term_index_interval = interval;
        Ok(self)
    }

    pub fn ram_buffer_size_mb(mut self, size: Option<f64>) -> SearchResult<Self> {
        if let Some(mb) = size {
            if mb <= 0.0 {
                return Err(SearchError::IllegalArgument(format!(
                    "ram_buffer_size_mb must be positive, got {mb}"
                )));
            }
        } else if self.max_buffered_docs.is_none() {
            return Err(SearchError::IllegalArgument(
                "cannot disable ram_buffer_size_mb while max_buffered_docs is disabled".to_string(),
            ));
        }
        self.ram_buffer_size_mb = size;
        Ok(self)
    }

    pub fn max_buffered_docs(mut self, count: Option<u32>) -> SearchResult<Self> {
        if let Some(n) = count {
            if n < 2 {
                return Err(SearchError::IllegalArgument(format!(
                    "max_buffered_docs must be at least 2, got {n}"
                )));
            }
        } else if self.ram_buffer_size_mb.is_none() {
            return Err(SearchError::IllegalArgument(
                "cannot disable max_buffered_docs while ram_buffer_size_mb is disabled".to_string(),
            ));
        }
        self.max_buffered_docs = count;
        Ok(self)
    }

    pub fn max_buffered_delete_terms(mut self, count: Option<u32>) -> Self {
        self.max_buffered_delete_terms = count;
        self
    }

    pub fn max_thread_states(mut self, count: usize) -> Self {
        self.max_thread_states = count.max(1);
        self
    }

    pub fn write_lock_timeout_ms(mut self, timeout: u64) -> Self {
        self.write_lock_timeout_ms = timeout;
        self
    }

    pub fn reader_pooling(mut self, pooling: bool) -> Self {
        self.reader_pooling = pooling;
        self
    }

    pub fn reader_terms_index_divisor(mut self, divisor: i32) -> SearchResult<Self> {
        if divisor == 0 || divisor < -1 {
            return Err(SearchError::IllegalArgument(format!(
                "reader_terms_index_divisor must be positive or -1, got {divisor}"
            )));
        }
        self.reader_terms_index_divisor = divisor;
        Ok(self)
    }

    pub fn merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn merge_scheduler(mut self, scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    pub fn deletion_policy(mut self, policy: Arc<dyn DeletionPolicy>) -> Self {
        self.deletion_policy = policy;
        self
    }

    /// Buffered RAM watermark in bytes, if the RAM trigger is enabled.
    pub fn ram_buffer_bytes(&self) -> Option<usize> {
        self.ram_buffer_size_mb
            .map(|mb| (mb * 1024.0 * 1024.0) as usize)
    }
}

impl fmt::Debug for IndexWriterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexWriterConfig")
            .field("open_mode", &self.open_mode)
            .field("term_index_interval", &self.term_index_interval)
            .field("ram_buffer_size_mb", &self.ram_buffer_size_mb)
            .field("max_buffered_docs", &self.max_buffered_docs)
            .field("max_buffered_delete_terms", &self.max_buffered_delete_terms)
            .field("max_thread_states", &self.max_thread_states)
            .field("write_lock_timeout_ms", &self.write_lock_timeout_ms)
            .field("reader_pooling", &self.reader_pooling)
            .field(
                "reader_terms_index_divisor",
                &self.reader_terms_index_divisor,
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::WhitespaceAnalyzer;

    fn config() -> IndexWriterConfig {
        IndexWriterConfig::new(Arc::new(WhitespaceAnalyzer))
    }

    #[test]
    fn both_flush_triggers_cannot_be_disabled() {
        let cfg = config().ram_buffer_size_mb(None);
        assert!(cfg.is_err());

        let cfg = config()
            .max_buffered_docs(Some(100))
            .unwrap()
            .ram_buffer_size_mb(None)
            .unwrap();
        assert!(cfg.max_buffered_docs(None).is_err());
    }

    #[test]
    fn clone_returns_the_populated_copy() {
        let cfg = config().max_thread_states(3);
        let copy = cfg.clone();
        assert_eq!(copy.max_thread_states, 3);
    }

    #[test]
    fn bad_values_rejected() {
        assert!(config().term_index_interval(0).is_err());
        assert!(config().max_buffered_docs(Some(1)).is_err());
        assert!(config().reader_terms_index_divisor(0).is_err());
    }
}
