//! Error types for docsync

use crate::storage::WriteError;
use thiserror::Error;

/// Result type alias using the docsync Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the document database
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from storage operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// LMDB/heed database errors
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// JSON (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Programmer misuse: bad primary keys, bad documents, bad names
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid schema definition
    #[error("Schema error: {0}")]
    Schema(String),

    /// Invalid query shape or unsupported operator
    #[error("Query error: {0}")]
    Query(String),

    /// A revision string that is not `<height>-<hash>`
    #[error("Malformed revision: {0}")]
    MalformedRevision(String),

    /// Operation on a closed or removed storage instance
    #[error("Storage instance closed: {0}")]
    Closed(String),

    /// Single-document write rejected by the categorizer
    #[error("Write conflict on document '{}' (status {})", .0.document_id, .0.status)]
    Conflict(Box<WriteError>),

    /// Document or attachment not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Replication driver failures that are not handler errors
    #[error("Replication error: {0}")]
    Replication(String),

    /// Schema migration failures
    #[error("Migration error: {0}")]
    Migration(String),

    /// Leader election failures
    #[error("Leadership error: {0}")]
    Leadership(String),

    /// Remote storage forwarding failures
    #[error("Remote storage error: {0}")]
    Remote(String),

    /// Broken invariant, never retried
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a query error
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Create a closed-instance error
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a migration error
    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }

    /// Create a leadership error
    pub fn leadership(msg: impl Into<String>) -> Self {
        Self::Leadership(msg.into())
    }

    /// Create a remote storage error
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error is a per-document write conflict (status 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(err) if err.status == 409)
    }

    /// Borrow the write error carried by a conflict
    pub fn as_conflict(&self) -> Option<&WriteError> {
        match self {
            Self::Conflict(err) => Some(err),
            _ => None,
        }
    }
}

impl From<WriteError> for Error {
    fn from(err: WriteError) -> Self {
        Self::Conflict(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentData;
    use crate::storage::{BulkWriteRow, WriteErrorKind};

    #[test]
    fn test_constructors() {
        assert!(matches!(Error::query("bad"), Error::Query(msg) if msg == "bad"));
        assert!(matches!(Error::internal("x"), Error::Internal(_)));
        assert_eq!(
            Error::validation("empty key").to_string(),
            "Validation error: empty key"
        );
    }

    #[test]
    fn test_conflict_detection() {
        let row = BulkWriteRow::insert(DocumentData::default());
        let err: Error = WriteError::new(WriteErrorKind::Conflict, "a", row, None).into();
        assert!(err.is_conflict());
        assert_eq!(err.as_conflict().map(|e| e.document_id.as_str()), Some("a"));
        assert!(!Error::closed("gone").is_conflict());
    }
}
