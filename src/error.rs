//! Error types for BigMap.
//!
//! Every fallible operation in the crate returns [`Result`]. Ordinary
//! outcomes such as a missing or expired key are regular `Ok(None)` results,
//! never errors.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while operating the store.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O operation on a page file or the page directory failed
    #[error("I/O error while trying to {op} '{}': {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A page's byte view was used after it was unmapped
    #[error("page {index} has been released")]
    PageReleased { index: u64 },

    /// A read or write ran past the end of a page
    #[error("access at offset {offset} with length {len} is out of bounds for page {index} (size {page_size})")]
    PageOutOfBounds {
        index: u64,
        offset: usize,
        len: usize,
        page_size: usize,
    },

    /// An existing page file does not match the configured page size
    #[error("page file '{}' is {actual} bytes, expected {expected}", path.display())]
    PageSizeMismatch {
        path: PathBuf,
        expected: usize,
        actual: u64,
    },

    /// A slot header could not be decoded into a valid record
    #[error("corrupt slot at index {index}: {reason}")]
    CorruptSlot { index: u64, reason: String },

    /// A slot was released or resolved that is not currently allocated
    #[error("slot {index} is not in use")]
    SlotNotInUse { index: u64 },

    /// A record does not fit into a single page
    #[error("entry of {length} bytes exceeds the maximum of {max} bytes per page")]
    EntryTooLarge { length: usize, max: usize },

    /// Invalid configuration supplied to `BigMap::open`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The map has been closed
    #[error("map is closed")]
    Closed,

    /// The background purge sweeper could not be started
    #[error("failed to start purge sweeper: {0}")]
    Sweeper(#[source] io::Error),

    /// A best-effort flush failed on one or more pages
    #[error("failed to flush {failed} of {total} cached pages")]
    FlushFailed { failed: usize, total: usize },
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Returns true if this error originated from the operating system.
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io { .. })
    }
}

/// Result type for BigMap operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mentions_path_and_op() {
        let err = Error::io(
            "map",
            "/tmp/page-3.dat",
            io::Error::other("boom"),
        );
        let msg = err.to_string();
        assert!(msg.contains("map"));
        assert!(msg.contains("page-3.dat"));
        assert!(err.is_io());
    }

    #[test]
    fn test_too_large_message() {
        let err = Error::EntryTooLarge {
            length: 100,
            max: 32,
        };
        assert_eq!(
            err.to_string(),
            "entry of 100 bytes exceeds the maximum of 32 bytes per page"
        );
        assert!(!err.is_io());
    }
}
