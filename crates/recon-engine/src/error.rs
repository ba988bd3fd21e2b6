//! Engine error taxonomy
//!
//! Errors are split by the scope they can affect:
//!
//! - [`NormalizeError`]: one record; the record is skipped and tallied
//! - [`SourceError`]: one data-source call; retried, then the check is recorded as `error`
//! - [`ValidationError`]: one check of one entity type; recorded as an `error` result
//! - [`StoreError`]: the run itself; retried once, then the run is `Failed`
//! - [`AlertError`]: a notification; logged only
//!
//! Data-quality findings (count variance, completeness, tolerance, schema drift) are
//! not errors. They are recorded as `fail` results with discrepancies.

use recon_common::EntityType;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::TransitionError;
use crate::source::Side;

/// Result type alias for orchestration-level operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Failure of a single data-source call
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Source call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed source payload: {0}")]
    Malformed(String),

    #[error("Source rejected request to {url} with status {status}")]
    Rejected { status: u16, url: String },
}

impl SourceError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_) | SourceError::Timeout(_))
    }
}

impl From<sqlx::Error> for SourceError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } | sqlx::Error::TypeNotFound { .. } => {
                SourceError::Malformed(err.to_string())
            },
            sqlx::Error::PoolTimedOut => SourceError::Unavailable("connection pool timed out".to_string()),
            other => SourceError::Unavailable(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Malformed(err.to_string())
        } else {
            SourceError::Unavailable(err.to_string())
        }
    }
}

/// A raw record that could not be mapped onto its typed entity struct
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("{entity_type} record is missing its primary key")]
    MissingPrimaryKey { entity_type: EntityType },

    #[error("{entity_type} record {record_id}: {message}")]
    InvalidField {
        entity_type: EntityType,
        record_id: String,
        message: String,
    },
}

/// Failure of one check for one entity type
#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("{side} stream is not ordered by primary key: '{previous}' followed by '{current}'")]
    OrderViolation {
        side: Side,
        previous: String,
        current: String,
    },

    #[error("{side} stream contains duplicate primary key '{key}'")]
    DuplicateKey { side: Side, key: String },

    #[error("Hash computation failed for record '{record_id}': {message}")]
    HashComputation { record_id: String, message: String },
}

/// Failure of the run store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Store rejected write: {0}")]
    Rejected(String),

    #[error("Corrupt stored row: {0}")]
    Corrupt(String),
}

/// Failure to deliver a run alert; never affects the run
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Alert delivery failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Alert endpoint responded with status {0}")]
    Rejected(u16),
}

/// Orchestration-level failure
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to open local snapshot: {0}")]
    Snapshot(#[source] SourceError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
