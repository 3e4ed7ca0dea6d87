mod fs;
mod input;
mod output;
mod ram;

pub use fs::FsDirectory;
pub use input::IndexInput;
pub use output::{IndexOutput, RamOutput};
pub use ram::RamDirectory;

use std::fmt;
use std::sync::Arc;

use crate::error::SearchResult;

/// Name of the lock file guarding single-writer access.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// A flat, name-keyed byte store. Everything else in the crate talks to
/// files only through this trait, so an index can live on disk or fully in
/// memory.
pub trait Directory: Send + Sync + fmt::Debug {
    fn list_all(&self) -> SearchResult<Vec<String>>;

    fn file_exists(&self, name: &str) -> bool;

    fn file_length(&self, name: &str) -> SearchResult<u64>;

    /// Last modification time in milliseconds. Used only as a change hint,
    /// never for correctness.
    fn file_modified(&self, name: &str) -> SearchResult<u64>;

    /// Creates a new file for sequential writing. Fails if the name already
    /// exists: segment file names are assigned at most once.
    fn create_output(&self, name: &str) -> SearchResult<Box<dyn IndexOutput>>;

    /// Opens a file for random-access reading. The returned input can be
    /// cloned into independent cursors sharing the same backing bytes.
    fn open_input(&self, name: &str) -> SearchResult<IndexInput>;

    fn delete_file(&self, name: &str) -> SearchResult<()>;

    fn rename(&self, from: &str, to: &str) -> SearchResult<()>;

    /// Durably persists the named files.
    fn sync(&self, names: &[String]) -> SearchResult<()>;

    /// Acquires the named exclusive lock, polling until `timeout_ms` has
    /// elapsed. The lock is released when the returned guard is dropped.
    fn obtain_lock(&self, name: &str, timeout_ms: u64) -> SearchResult<LockGuard>;

    /// Forcibly removes a lock left behind by a crashed process.
    fn clear_lock(&self, name: &str) -> SearchResult<()>;

    /// When enabled, `delete_file` refuses to remove a file that an open
    /// input still references, so all platforms behave like the strictest
    /// one. The deleter retries such files later.
    fn set_prevent_delete_open_files(&self, prevent: bool);
}

/// Releases the underlying lock on drop.
pub struct LockGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            release: Some(release),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LockGuard")
    }
}

pub type DirectoryRc = Arc<dyn Directory>;
