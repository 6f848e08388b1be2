//! Error types for the coordination protocols

use shm_coord_shared_memory::{ErrorCategory as SharedCategory, SharedMemoryError};
use std::path::PathBuf;
use thiserror::Error;

/// Coordination error types
#[derive(Error, Debug)]
pub enum CoordError {
    /// Shared region, gate or segment failure
    #[error("Shared resource error: {0}")]
    Resource(#[from] SharedMemoryError),

    /// An input file could not be opened or read
    #[error("Cannot read input {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Push on a full stack
    #[error("Stack is full ({capacity} entries)")]
    StackFull { capacity: usize },

    /// Pop on an empty stack
    #[error("Stack is empty")]
    StackEmpty,

    /// Malformed data (matrix files, worker reports)
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, CoordError>;

/// Error categories for reporting and exit handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Named resources could not be created, attached or removed
    Resource,
    /// Input missing, unreadable or malformed
    Input,
    /// A bounded structure refused the operation
    Capacity,
    /// Shared state used against its protocol
    Protocol,
}

impl CoordError {
    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoordError::Resource(err) => match err.category() {
                SharedCategory::Protocol => ErrorCategory::Protocol,
                SharedCategory::Resource | SharedCategory::Timeout | SharedCategory::Io => {
                    ErrorCategory::Resource
                }
            },
            CoordError::Input { .. } | CoordError::InvalidData(_) | CoordError::Io(_) => ErrorCategory::Input,
            CoordError::StackFull { .. } | CoordError::StackEmpty => ErrorCategory::Capacity,
        }
    }

    /// Whether retrying the same operation later might succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            CoordError::Resource(err) => err.is_recoverable(),
            CoordError::StackFull { .. } | CoordError::StackEmpty => true,
            _ => false,
        }
    }

    /// Wrap an IO error with the path it concerns
    pub fn input(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CoordError::Input {
            path: path.into(),
            source,
        }
    }
}
