//! Error types for lsmtable.

use std::io;
use thiserror::Error as ThisError;

/// The result type used throughout lsmtable.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for table reads, writes and iteration.
#[derive(Debug, ThisError)]
pub enum Error {
    /// An I/O error surfaced by the underlying readable or sink.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption was detected.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// A block's stored checksum did not match its contents.
    #[error(
        "Data corruption: checksum mismatch in file {file_num} at {offset}/{length}: \
         expected {expected:#x}, got {actual:#x}"
    )]
    ChecksumMismatch {
        /// File number of the table.
        file_num: u64,
        /// Offset of the block.
        offset: u64,
        /// Length of the block, trailer excluded.
        length: u64,
        /// The checksum stored in the block trailer.
        expected: u32,
        /// The checksum computed over the block contents.
        actual: u32,
    },

    /// The table was written with a comparer this reader does not know.
    #[error("Data corruption: file {file_num}: unknown comparer {name}")]
    UnknownComparer {
        /// File number of the table.
        file_num: u64,
        /// Comparer name recorded in the table properties.
        name: String,
    },

    /// The table was written with a merger this reader does not know.
    #[error("Data corruption: file {file_num}: unknown merger {name}")]
    UnknownMerger {
        /// File number of the table.
        file_num: u64,
        /// Merger name recorded in the table properties.
        name: String,
    },

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not supported for this table.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The reader has been closed.
    #[error("reader is closed")]
    ReaderClosed,
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new not supported error.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Returns true if the error reports damaged or unreadable table contents.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_)
                | Error::ChecksumMismatch { .. }
                | Error::UnknownComparer { .. }
                | Error::UnknownMerger { .. }
        )
    }

    /// Produces an equivalent error value.
    ///
    /// Iterators keep their first error sticky while callers may also want to own it.
    /// `io::Error` is not `Clone`, so I/O errors are rebuilt from their kind and message.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Corruption(m) => Error::Corruption(m.clone()),
            Error::ChecksumMismatch { file_num, offset, length, expected, actual } => {
                Error::ChecksumMismatch {
                    file_num: *file_num,
                    offset: *offset,
                    length: *length,
                    expected: *expected,
                    actual: *actual,
                }
            }
            Error::UnknownComparer { file_num, name } => {
                Error::UnknownComparer { file_num: *file_num, name: name.clone() }
            }
            Error::UnknownMerger { file_num, name } => {
                Error::UnknownMerger { file_num: *file_num, name: name.clone() }
            }
            Error::InvalidArgument(m) => Error::InvalidArgument(m.clone()),
            Error::NotSupported(m) => Error::NotSupported(m.clone()),
            Error::ReaderClosed => Error::ReaderClosed,
        }
    }
}
