//! Error types for hangout-projections

use thiserror::Error;

use crate::model::ItemKey;

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Condition failed for {key}: {reason}")]
    ConditionFailed { key: ItemKey, reason: String },

    #[error("Gave up on {key} after {attempts} conflicting attempts")]
    ConcurrencyExhausted { key: ItemKey, attempts: usize },

    #[error("Transaction canceled at item {index}: {reason}")]
    TransactionCanceled { index: usize, reason: String },

    #[error("Transaction has {items} items, limit is {limit}")]
    TransactionTooLarge { items: usize, limit: usize },

    #[error("Bulk operation stopped after {committed} of {total} items: {reason}")]
    PartialBulk {
        committed: usize,
        total: usize,
        reason: String,
    },

    #[error("Invalid pagination cursor: {0}")]
    InvalidCursor(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProjectionError {
    /// Whether the error came from an optimistic concurrency check and the
    /// operation may succeed if rebuilt from fresh reads.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ProjectionError::ConditionFailed { .. } | ProjectionError::TransactionCanceled { .. }
        )
    }
}

impl From<rusqlite::Error> for ProjectionError {
    fn from(e: rusqlite::Error) -> Self {
        ProjectionError::Database(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
