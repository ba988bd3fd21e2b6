//! Error types for the recon CLI
//!
//! Messages are user-facing and say what to check next. Every error maps to
//! exit code 2: the run could not be carried out.

use recon_engine::error::{EngineError, SourceError, StoreError};
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// The run could not be started or finished
    #[error("Reconciliation failed: {0}")]
    Engine(#[from] EngineError),

    /// The run history could not be read or written
    #[error("Run store error: {0}. Check DATABASE_URL and that 'recon migrate' has been run.")]
    Store(#[from] StoreError),

    /// A data source could not be constructed
    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    /// A required setting is missing or invalid
    #[error("Configuration error: {0}. Check your environment variables or config file.")]
    Config(String),

    /// Command-line arguments are inconsistent
    #[error("Invalid arguments: {0}. Run with '--help' for usage.")]
    InvalidArgument(String),

    /// Output could not be rendered
    #[error("Failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
