use std::path::Path;

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the segment lists and the managed file store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Operation {operation} is not allowed while {role}")]
    IllegalRole {
        operation: &'static str,
        role: String,
    },

    #[error("Out of sequence write: expected offset {expected}, got {actual}")]
    Sequence { expected: u64, actual: u64 },

    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    #[error("Log entry at index {0} not found")]
    NotFound(u64),

    #[error("Read of {size} bytes at offset {offset} is out of range (limit {limit})")]
    OutOfRange { offset: u64, size: u64, limit: u64 },

    #[error("Corrupted record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    #[error("Record of {size} bytes does not fit a segment (max {max})")]
    RecordTooLarge { size: u64, max: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store is fenced after a fatal error, recover or reopen it first")]
    Fenced,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        StoreError::CorruptRecord {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn io_at(path: &Path, err: std::io::Error) -> Self {
        StoreError::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {}", path.display(), err),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    Fatal,       // the store must stop accepting writes
    Recoverable, // the caller may retry after fixing its view (truncate, re-read ...)
    Ignorable,   // only worth a log line
}

pub trait ErrorHandler {
    fn severity(&self) -> ErrorSeverity;
    fn context(&self) -> String;
}

impl ErrorHandler for StoreError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StoreError::Io(_) => ErrorSeverity::Fatal,
            StoreError::CorruptRecord { .. } => ErrorSeverity::Fatal,
            StoreError::Sequence { .. } => ErrorSeverity::Fatal,
            StoreError::IllegalRole { .. } => ErrorSeverity::Recoverable,
            StoreError::InconsistentState(_) => ErrorSeverity::Recoverable,
            StoreError::RecordTooLarge { .. } => ErrorSeverity::Recoverable,
            StoreError::Config(_) => ErrorSeverity::Recoverable,
            StoreError::NotFound(_) => ErrorSeverity::Ignorable,
            StoreError::OutOfRange { .. } => ErrorSeverity::Ignorable,
            StoreError::Fenced => ErrorSeverity::Ignorable,
        }
    }

    fn context(&self) -> String {
        match self {
            StoreError::IllegalRole { operation, role } => {
                format!("{} rejected, member is {}", operation, role)
            }
            StoreError::Sequence { expected, actual } => {
                format!("sequence broken at {} (expected {})", actual, expected)
            }
            StoreError::InconsistentState(msg) => format!("inconsistent state: {}", msg),
            StoreError::NotFound(idx) => format!("index {} not found", idx),
            StoreError::OutOfRange {
                offset,
                size,
                limit,
            } => format!("read [{}, {}) beyond {}", offset, offset + size, limit),
            StoreError::CorruptRecord { offset, reason } => {
                format!("corrupted record at {}: {}", offset, reason)
            }
            StoreError::RecordTooLarge { size, max } => {
                format!("record of {}B exceeds {}B", size, max)
            }
            StoreError::Io(e) => format!("IO error: {}", e),
            StoreError::Fenced => "store fenced".to_string(),
            StoreError::Config(msg) => format!("invalid configuration: {}", msg),
        }
    }
}
