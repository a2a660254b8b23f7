//! Error Types for LogKV
//!
//! All engine operations return [`Result<T>`] which is aliased to
//! `Result<T, Error>`, so `?` propagation works across crate boundaries.
//!
//! ## Error Categories
//!
//! ### Lookup Errors
//! - `NotFound`: key absent from every segment
//! - `WrongType`: stored type tag differs from the requested one
//!
//! ### Data Integrity Errors
//! - `CorruptedFrame`: a frame's declared size and its bytes disagree, or
//!   the type tag is unknown
//! - `CorruptedSegment`: mid-file structural damage found while rebuilding
//!   a segment's index
//!
//! ### Directory Errors
//! - `UnrecognizedFile`: a file in the storage directory does not match
//!   the `segment-<n>` naming scheme
//!
//! ### Lifecycle Errors
//! - `Io`: an underlying I/O failure, carrying the path it happened on
//! - `Closed`: operation attempted on a shut-down database or segment

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::entry::TypeTag;

#[derive(Debug, Error)]
pub enum Error {
    #[error("record does not exist")]
    NotFound,

    #[error("wrong value type: stored {stored}, requested {requested}")]
    WrongType { stored: TypeTag, requested: TypeTag },

    #[error("corrupted frame: {0}")]
    CorruptedFrame(String),

    #[error("corrupted segment {}: {reason}", .path.display())]
    CorruptedSegment { path: PathBuf, reason: String },

    #[error("unrecognized file in storage directory: {0} (expected segment-<n>)")]
    UnrecognizedFile(String),

    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage is closed")]
    Closed,
}

impl Error {
    /// Attach the path an I/O failure happened on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
