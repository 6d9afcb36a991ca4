use thiserror::Error;

/// Errors raised by checkpoint store implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The (instance, sequence) pair already exists.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StorageError {
    /// Conflicts are permanent; other failures may succeed on a later write.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StorageError::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Query("disk I/O error".to_string());
        assert_eq!(err.to_string(), "query error: disk I/O error");

        let err = StorageError::Conflict("checkpoint 3 exists".to_string());
        assert_eq!(err.to_string(), "conflict: checkpoint 3 exists");
    }

    #[test]
    fn test_conflict_is_not_transient() {
        assert!(!StorageError::Conflict("dup".into()).is_transient());
        assert!(StorageError::Connection("closed".into()).is_transient());
    }
}
