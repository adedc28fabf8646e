//! Error types for PackDB
//!
//! Provides a unified error type hierarchy for the storage core.

use thiserror::Error;

/// Result type alias using PackDB's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for PackDB
#[derive(Error, Debug)]
pub enum Error {
    // Storage Errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // Query Errors
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true when the error reports a cooperative cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Query(QueryError::Cancelled))
    }

    /// Returns true for structural errors (missing buckets, tables or packs).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Storage(
                StorageError::BucketNotFound(_)
                    | StorageError::TableNotFound(_)
                    | StorageError::PackNotFound(_)
            )
        )
    }
}

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableExists(String),

    #[error("Pack not found: {0:#010x}")]
    PackNotFound(u32),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Checksum mismatch in {0}")]
    ChecksumMismatch(String),

    #[error("Flush loop limit exceeded after {loops} iterations (limit {limit})")]
    FlushLoop { loops: usize, limit: usize },

    #[error("Transaction is read-only")]
    ReadOnlyTx,
}

/// Query-related errors
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("Missing primary key")]
    MissingPrimaryKey,

    #[error("Primary key out of bounds: {0}")]
    OutOfBounds(u64),

    #[error("Query cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err: Error = QueryError::Cancelled.into();
        assert!(err.is_cancelled());
        assert!(!err.is_not_found());

        let err: Error = StorageError::PackNotFound(7).into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Storage error: Pack not found: 0x00000007");
    }

    #[test]
    fn test_flush_loop_message() {
        let err = StorageError::FlushLoop { loops: 13, limit: 6 };
        assert!(err.to_string().contains("13 iterations"));
    }
}
