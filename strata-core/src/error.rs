//! Error types for strata operations

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(String),

    #[error("Glob pattern error: {0}")]
    GlobPattern(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable at {}: {message}", .path.display())]
    StoreUnavailable { path: PathBuf, message: String },

    #[error("Store lock poisoned")]
    StoreLockPoisoned,

    #[error("Schema version mismatch: database is v{found}, expected v{expected}. Clear the index directory to rebuild.")]
    SchemaVersionMismatch { found: i32, expected: i32 },

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Failed to generate embeddings for {chunks} chunks with provider: {provider}: {message}")]
    Embedding {
        provider: String,
        chunks: usize,
        message: String,
    },

    #[error("Workspace error for {}: {message}", .root.display())]
    Workspace { root: PathBuf, message: String },

    #[error("Index kind {0} registered twice")]
    DuplicateIndex(&'static str),

    #[error("No {artifact} artifact for content {cache_key}")]
    MissingArtifact {
        artifact: &'static str,
        cache_key: String,
    },
}

impl StrataError {
    /// Errors after which the current root's pass cannot usefully continue.
    pub fn is_fatal_for_pass(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable { .. } | Self::StoreLockPoisoned | Self::Embedding { .. }
        )
    }

    /// True when the on-disk index is likely damaged and should be rebuilt.
    ///
    /// `SQLITE_BUSY` and friends are deliberately absent: they are transient.
    pub fn should_clear_indexes(&self) -> bool {
        use rusqlite::ErrorCode;
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::ConstraintViolation
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DiskFull
                    | ErrorCode::Unknown
            ),
            Self::SchemaVersionMismatch { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> StrataError {
        StrataError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn test_corruption_requests_clear() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_CORRUPT).should_clear_indexes());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).should_clear_indexes());
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_BUSY).should_clear_indexes());
    }

    #[test]
    fn test_embedding_error_is_fatal_and_descriptive() {
        let err = StrataError::Embedding {
            provider: "fake".to_string(),
            chunks: 3,
            message: "timeout".to_string(),
        };
        assert!(err.is_fatal_for_pass());
        assert_eq!(
            err.to_string(),
            "Failed to generate embeddings for 3 chunks with provider: fake: timeout"
        );
    }

    #[test]
    fn test_missing_artifact_is_not_fatal() {
        let err = StrataError::MissingArtifact {
            artifact: "chunks",
            cache_key: "abc".to_string(),
        };
        assert!(!err.is_fatal_for_pass());
        assert!(!err.should_clear_indexes());
    }
}
