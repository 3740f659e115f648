//! Error types for navindex.

use thiserror::Error;

/// Main error type for navindex.
#[derive(Error, Debug)]
pub enum NavindexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("Shared memory '{name}': {message}")]
    SharedMemory { name: String, message: String },

    #[error("Shared memory segment '{0}' does not exist. Was the indexing owner started?")]
    SegmentNotFound(String),

    #[error(
        "Out of shared memory in '{name}': requested {requested} bytes, {free} of {size} bytes free"
    )]
    OutOfSharedMemory {
        name: String,
        requested: usize,
        free: usize,
        size: usize,
    },

    #[error("Shared memory segment '{name}' is corrupted: {reason}")]
    CorruptSegment { name: String, reason: String },

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl NavindexError {
    /// Shorthand for a [`NavindexError::SharedMemory`] failure.
    pub fn shared_memory(name: impl Into<String>, message: impl Into<String>) -> Self {
        NavindexError::SharedMemory {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Whether this is an out-of-shared-memory condition.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, NavindexError::OutOfSharedMemory { .. })
    }
}

/// Result type alias for navindex operations.
pub type Result<T> = std::result::Result<T, NavindexError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_segment_not_found_message() {
        let err = NavindexError::SegmentNotFound("icmd_1234".to_string());
        let msg = err.to_string();
        assert!(msg.contains("icmd_1234"));
        assert!(msg.contains("does not exist"));
    }

    #[test]
    fn test_out_of_shared_memory_message() {
        let err = NavindexError::OutOfSharedMemory {
            name: "ists_abcd".to_string(),
            requested: 4096,
            free: 100,
            size: 1024,
        };
        let msg = err.to_string();
        assert!(msg.contains("ists_abcd"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("100 of 1024"));
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_corrupt_segment_message() {
        let err = NavindexError::CorruptSegment {
            name: "iist_1_x".to_string(),
            reason: "bad magic".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("iist_1_x"));
        assert!(msg.contains("bad magic"));
        assert!(!err.is_out_of_memory());
    }

    #[test]
    fn test_shared_memory_shorthand() {
        let err = NavindexError::shared_memory("seg", "mmap failed");
        assert_eq!(err.to_string(), "Shared memory 'seg': mmap failed");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: NavindexError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{ invalid json }").unwrap_err();
        let err: NavindexError = json_err.into();
        assert!(err.to_string().contains("JSON"));
    }

    #[test]
    fn test_errno_conversion() {
        let err: NavindexError = nix::errno::Errno::ENOENT.into();
        assert!(err.to_string().starts_with("OS error"));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(NavindexError::Worker("boom".to_string()))
        }

        assert_eq!(returns_ok().unwrap(), 42);
        assert!(returns_err().is_err());
    }
}
