#![forbid(unsafe_code)]
//! Error types for REVFS.
//!
//! Defines `VfsError` and a `Result<T>` alias used throughout the
//! workspace. Each public filesystem operation surfaces exactly one of
//! these kinds; checksum mismatches on read are deliberately *not* errors
//! and are logged instead.

use revfs_types::LayoutError;
use thiserror::Error;

/// Unified error type for all REVFS operations.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("filesystem is not mounted")]
    NotMounted,

    #[error("filesystem is already mounted")]
    AlreadyMounted,

    #[error("bad image: {0}")]
    BadImage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotADirectory,

    #[error("not a regular file")]
    NotAFile,

    #[error("directory not empty")]
    NotEmpty,

    #[error("no free inodes")]
    NoInodes,

    #[error("no free blocks")]
    NoBlocks,

    #[error("directory has no free entry slot")]
    DirectoryFull,

    #[error("name too long")]
    NameTooLong,

    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LayoutError> for VfsError {
    fn from(err: LayoutError) -> Self {
        Self::BadImage(err.to_string())
    }
}

/// Result alias using `VfsError`.
pub type Result<T> = std::result::Result<T, VfsError>;
