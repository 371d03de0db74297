// ⚠️ Error taxonomy for the linkage engine
//
// Field-level and pair-level problems are recovered locally and counted.
// Store-level problems outside a merge savepoint abort the run.

use thiserror::Error;

/// Errors produced by the linkage engine.
#[derive(Error, Debug)]
pub enum LinkageError {
    /// A record lacks a field needed for blocking, scoring or hierarchy placement.
    #[error("entity '{entity_id}' is missing field '{field}'")]
    MissingField { entity_id: String, field: &'static str },

    /// A reference rewrite would duplicate an existing keeper row.
    #[error("reference conflict in {table}.{column}: {count} row(s) already point at '{keeper}'")]
    ReferenceConflict {
        table: String,
        column: String,
        keeper: String,
        count: usize,
    },

    /// A hierarchy walk revisited an identifier already in its chain.
    #[error("ownership cycle detected at '{identifier}' after {depth} hop(s)")]
    CycleDetected { identifier: String, depth: usize },

    /// One merge failed and was rolled back; the batch continues.
    #[error("merge of '{deleted_id}' into '{kept_id}' rolled back: {reason}")]
    PartialMergeFailure {
        kept_id: String,
        deleted_id: String,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid identifier kind: {0}")]
    InvalidIdentifier(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, LinkageError>;

impl LinkageError {
    /// Transient lock contention on the store; the operation may be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            LinkageError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// The store itself is unusable; the whole batch must stop.
    pub fn is_fatal(&self) -> bool {
        match self {
            LinkageError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::DatabaseCorrupt
                    | rusqlite::ErrorCode::NotADatabase
                    | rusqlite::ErrorCode::DiskFull
                    | rusqlite::ErrorCode::ReadOnly
            ),
            _ => false,
        }
    }
}
