//! Error types for the Canopy namespace master.
//!
//! This module provides a unified error type [`CanopyError`] for all namespace
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Lookup**: the path, inode or mount does not exist
//! - **Conflict**: the target of a create or rename already exists
//! - **Structure**: invalid paths, root operations, stale lock walks
//! - **Access**: permission checks and read-only mounts
//! - **Precondition**: the namespace is not in a state that allows the call
//! - **Backpressure / Outage**: job service saturation, journal or storage down
//!
//! # Example
//!
//! ```rust
//! use canopy::error::{CanopyError, ErrorCategory, Result};
//!
//! fn check(path: &str) -> Result<()> {
//!     if !path.starts_with('/') {
//!         return Err(CanopyError::InvalidPath(format!("{} is not absolute", path)));
//!     }
//!     Ok(())
//! }
//!
//! let err = check("relative").unwrap_err();
//! assert_eq!(err.category(), ErrorCategory::InvalidPath);
//! assert!(!err.is_retryable());
//! ```

use std::io;
use thiserror::Error;

/// Main error type for namespace operations.
#[derive(Error, Debug)]
pub enum CanopyError {
    // Lookup errors
    #[error("Path does not exist: {0}")]
    NotFound(String),

    #[error("Inode not found: {0}")]
    InodeNotFound(u64),

    #[error("Path must be a file: {0}")]
    NotAFile(String),

    #[error("Path must be a directory: {0}")]
    NotADirectory(String),

    #[error("Mount point not found: {0}")]
    MountNotFound(String),

    // Conflict errors
    #[error("Path already exists: {0}")]
    AlreadyExists(String),

    // Structural errors
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path changed concurrently: {0}")]
    PathChanged(String),

    // Access errors
    #[error("Access denied: {0}")]
    AccessDenied(String),

    // Precondition errors
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("File already completed: {0}")]
    FileAlreadyCompleted(String),

    #[error("Block info error: {0}")]
    BlockInfo(String),

    #[error("Invalid file size: {0}")]
    InvalidFileSize(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Backpressure and outage
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // Under storage errors
    #[error("Under storage error: {0}")]
    Ufs(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`CanopyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    NotFound,
    AlreadyExists,
    InvalidPath,
    AccessDenied,
    PreconditionFailed,
    ResourceExhausted,
    Unavailable,
    Cancelled,
    Internal,
}

impl CanopyError {
    /// Classify the error into one of the user-visible categories.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CanopyError::NotFound(_)
            | CanopyError::InodeNotFound(_)
            | CanopyError::NotAFile(_)
            | CanopyError::MountNotFound(_) => ErrorCategory::NotFound,
            CanopyError::AlreadyExists(_) => ErrorCategory::AlreadyExists,
            CanopyError::InvalidPath(_)
            | CanopyError::PathChanged(_)
            | CanopyError::NotADirectory(_) => ErrorCategory::InvalidPath,
            CanopyError::AccessDenied(_) => ErrorCategory::AccessDenied,
            CanopyError::PreconditionFailed(_)
            | CanopyError::DirectoryNotEmpty(_)
            | CanopyError::FileAlreadyCompleted(_)
            | CanopyError::BlockInfo(_)
            | CanopyError::InvalidFileSize(_)
            | CanopyError::InvalidArgument(_) => ErrorCategory::PreconditionFailed,
            CanopyError::ResourceExhausted(_) => ErrorCategory::ResourceExhausted,
            CanopyError::Unavailable(_) | CanopyError::Ufs(_) | CanopyError::Io(_) => {
                ErrorCategory::Unavailable
            }
            CanopyError::Cancelled(_) => ErrorCategory::Cancelled,
            CanopyError::Config(_)
            | CanopyError::InvalidConfig { .. }
            | CanopyError::Serialization(_)
            | CanopyError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Check if the operation may succeed when retried from the top.
    ///
    /// Only concurrent modification of a locked path qualifies; genuine
    /// invalid input is never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CanopyError::PathChanged(_))
    }

    /// Check if the error means the path or inode does not exist.
    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }
}

impl From<bincode::Error> for CanopyError {
    fn from(e: bincode::Error) -> Self {
        CanopyError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for CanopyError {
    fn from(e: serde_json::Error) -> Self {
        CanopyError::Serialization(e.to_string())
    }
}

/// Result type alias for namespace operations.
pub type Result<T> = std::result::Result<T, CanopyError>;
