//! Crate-wide error type with stable wire status codes.
//!
//! Every fallible operation in the crate returns [`FsResult`]. Each error
//! kind maps to a small integer carried as a varint in RPC response frames,
//! so a status decoded on the client compares equal to the status raised on
//! the server.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type FsResult<T> = Result<T, FsError>;

/// Filesystem error kinds.
///
/// `StaleDirIndex` may carry the server's current directory index snapshot
/// so the client can refresh its cached index and retry without an extra
/// round trip.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("parent lease expired")]
    LeaseExpired,

    #[error("stale directory index")]
    StaleDirIndex { snapshot: Option<Vec<u8>> },

    #[error("batch already in progress on this directory")]
    BatchInProgress,

    #[error("operation timed out")]
    Timeout,

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl FsError {
    /// Stable status code used on the wire. 0 is reserved for OK.
    pub fn code(&self) -> u64 {
        match self {
            FsError::NotFound(_) => 1,
            FsError::AlreadyExists(_) => 2,
            FsError::PermissionDenied(_) => 3,
            FsError::LeaseExpired => 4,
            FsError::StaleDirIndex { .. } => 5,
            FsError::BatchInProgress => 6,
            FsError::Timeout => 7,
            FsError::NotADirectory(_) => 8,
            FsError::Io(_) => 9,
            FsError::Corruption(_) => 10,
            FsError::InvalidArgument(_) => 11,
        }
    }

    /// Rebuild an error from a wire status code and a detail message.
    ///
    /// Unknown codes decode as `Io` so that a newer peer cannot make an
    /// older client panic.
    pub fn from_code(code: u64, detail: String) -> FsError {
        match code {
            1 => FsError::NotFound(detail),
            2 => FsError::AlreadyExists(detail),
            3 => FsError::PermissionDenied(detail),
            4 => FsError::LeaseExpired,
            5 => FsError::StaleDirIndex { snapshot: None },
            6 => FsError::BatchInProgress,
            7 => FsError::Timeout,
            8 => FsError::NotADirectory(detail),
            10 => FsError::Corruption(detail),
            11 => FsError::InvalidArgument(detail),
            _ => FsError::Io(detail),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, FsError::AlreadyExists(_))
    }

    pub fn is_stale_index(&self) -> bool {
        matches!(self, FsError::StaleDirIndex { .. })
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => FsError::Timeout,
            std::io::ErrorKind::NotFound => FsError::NotFound(e.to_string()),
            _ => FsError::Io(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        let errors = vec![
            FsError::NotFound("a".to_string()),
            FsError::AlreadyExists("a".to_string()),
            FsError::PermissionDenied("a".to_string()),
            FsError::LeaseExpired,
            FsError::StaleDirIndex { snapshot: None },
            FsError::BatchInProgress,
            FsError::Timeout,
            FsError::NotADirectory("a".to_string()),
            FsError::Io("a".to_string()),
            FsError::Corruption("a".to_string()),
            FsError::InvalidArgument("a".to_string()),
        ];
        for err in errors {
            let back = FsError::from_code(err.code(), "a".to_string());
            assert_eq!(back.code(), err.code());
        }
    }

    #[test]
    fn test_unknown_code_is_io() {
        assert!(matches!(FsError::from_code(255, String::new()), FsError::Io(_)));
    }
}
