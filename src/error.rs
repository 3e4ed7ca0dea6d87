use std::io;

use thiserror::Error;

pub type SearchResult<T> = std::result::Result<T, SearchError>;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("corrupt index: {0}")]
    CorruptIndex(String),
    #[error("could not obtain lock: {0}")]
    LockObtainFailed(String),
    #[error("already closed: {0}")]
    AlreadyClosed(&'static str),
    #[error("merge aborted: {0}")]
    MergeAborted(String),
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    #[error("stale reader: {0}")]
    StaleReader(String),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("document not found")]
    DocNotFound,
    #[error("error in worker thread: {0}")]
    ThreadError(String),
}

impl SearchError {
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        SearchError::CorruptIndex(msg.into())
    }

    /// Maps `NotFound` io errors onto the dedicated variant so callers can
    /// distinguish a missing segment file from a failing disk.
    pub fn from_io(name: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            SearchError::FileNotFound(name.to_string())
        } else {
            SearchError::Io(err)
        }
    }
}
