use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Schema conflict for '{entity_type}': {reason}")]
    SchemaConflict {
        entity_type: String,
        reason: String,
        fields: Vec<String>,
    },
    #[error("Version conflict on {entity}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        entity: String,
        expected: Option<i64>,
        found: Option<i64>,
    },
    #[error("Storage unavailable after {attempts} attempt(s): {reason}")]
    StorageUnavailable { attempts: u32, reason: String },
    #[error("Traversal depth {requested} exceeds the maximum of {max}")]
    TraversalDepthExceeded { requested: usize, max: usize },
    #[error("Query timed out after {elapsed_ms}ms; partial result discarded")]
    QueryTimeout { elapsed_ms: u64 },
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification callers use to tell failures apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    NotFound,
    Transient,
    Malformed,
    Conflict,
    Internal,
}

impl CatalogError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CatalogError::NotFound(_) => ErrorClass::NotFound,
            CatalogError::StorageUnavailable { .. } | CatalogError::QueryTimeout { .. } => {
                ErrorClass::Transient
            }
            CatalogError::IoError(_) => ErrorClass::Transient,
            CatalogError::RusqliteError(_) if self.is_transient() => ErrorClass::Transient,
            CatalogError::ValidationError(_)
            | CatalogError::TraversalDepthExceeded { .. }
            | CatalogError::JsonError(_)
            | CatalogError::ConfigError(_) => ErrorClass::Malformed,
            CatalogError::SchemaConflict { .. } | CatalogError::VersionConflict { .. } => {
                ErrorClass::Conflict
            }
            CatalogError::RusqliteError(_) | CatalogError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Busy/locked databases and I/O failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::RusqliteError(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DiskFull
            ),
            CatalogError::IoError(_) | CatalogError::StorageUnavailable { .. } => true,
            _ => false,
        }
    }
}
