//! Shared memory specific error types

use thiserror::Error;

/// Shared memory error types
#[derive(Error, Debug)]
pub enum SharedMemoryError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Region, gate or segment not found (never created, unlinked, or destroyed)
    #[error("Shared resource not found: {0}")]
    NotFound(String),

    /// Invalid resource name
    #[error("Invalid resource name: {0}")]
    InvalidName(String),

    /// Attacher asked for a different size than the creator allocated
    #[error("Size mismatch for {name}: expected {expected} bytes, found {actual}")]
    SizeMismatch { name: String, expected: usize, actual: usize },

    /// Raw access outside the mapped bytes
    #[error("Access of {len} bytes at offset {offset} exceeds region size {size}")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    /// OS refused to allocate the resource
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Segment payload was laid out by a different protocol
    #[error("Layout mismatch for {name}: expected {expected:#010x}, found {found:#010x}")]
    LayoutMismatch { name: String, expected: u32, found: u32 },

    /// Shared state violates its own invariants
    #[error("Shared state corrupted: {0}")]
    Corrupted(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, SharedMemoryError>;

/// Error categories used for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Creating, attaching, sizing or destroying a named resource failed
    Resource,
    /// Shared state used against the protocol (destroyed, foreign layout, corrupted)
    Protocol,
    Timeout,
    Io,
}

impl SharedMemoryError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            SharedMemoryError::Timeout(_) => true,
            SharedMemoryError::Io(err) => {
                matches!(err.kind(),
                    std::io::ErrorKind::TimedOut |
                    std::io::ErrorKind::WouldBlock |
                    std::io::ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            SharedMemoryError::NotFound(_)
            | SharedMemoryError::LayoutMismatch { .. }
            | SharedMemoryError::Corrupted(_)
            | SharedMemoryError::OutOfBounds { .. } => ErrorCategory::Protocol,
            SharedMemoryError::Timeout(_) => ErrorCategory::Timeout,
            SharedMemoryError::Io(_) => ErrorCategory::Io,
            SharedMemoryError::Platform(_)
            | SharedMemoryError::InvalidName(_)
            | SharedMemoryError::SizeMismatch { .. }
            | SharedMemoryError::ResourceExhausted(_)
            | SharedMemoryError::PermissionDenied(_) => ErrorCategory::Resource,
        }
    }

    /// Convert platform-specific error codes to SharedMemoryError
    pub fn from_errno(errno: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match errno {
            libc::EACCES | libc::EPERM => SharedMemoryError::PermissionDenied(message),
            libc::ENOENT => SharedMemoryError::NotFound(message),
            libc::ENOMEM | libc::ENOSPC | libc::EMFILE | libc::ENFILE => {
                SharedMemoryError::ResourceExhausted(message)
            }
            libc::EINVAL | libc::ENAMETOOLONG => SharedMemoryError::InvalidName(message),
            _ => SharedMemoryError::Platform(format!(
                "{}: {}",
                message,
                std::io::Error::from_raw_os_error(errno)
            )),
        }
    }

    /// Convert the calling thread's last OS error
    pub fn last_os_error(message: impl Into<String>) -> Self {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::from_errno(errno, message)
    }
}

impl From<nix::errno::Errno> for SharedMemoryError {
    fn from(errno: nix::errno::Errno) -> Self {
        SharedMemoryError::from_errno(errno as i32, errno.desc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert!(matches!(
            SharedMemoryError::from_errno(libc::ENOENT, "/missing"),
            SharedMemoryError::NotFound(name) if name == "/missing"
        ));
        assert!(matches!(
            SharedMemoryError::from_errno(libc::EMFILE, "shm_open"),
            SharedMemoryError::ResourceExhausted(_)
        ));
        assert!(matches!(
            SharedMemoryError::from_errno(libc::EACCES, "shm_open"),
            SharedMemoryError::PermissionDenied(_)
        ));
        assert!(matches!(
            SharedMemoryError::from_errno(libc::EBUSY, "sem_wait"),
            SharedMemoryError::Platform(_)
        ));
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            SharedMemoryError::NotFound("/x".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(
            SharedMemoryError::ResourceExhausted("/x".into()).category(),
            ErrorCategory::Resource
        );
        assert!(SharedMemoryError::Timeout("gate".into()).is_recoverable());
        assert!(!SharedMemoryError::Corrupted("top".into()).is_recoverable());
    }
}
