//! Error types shared across the reconciliation workspace

use thiserror::Error;

/// Failure to parse one of the shared enums from its textual form
#[derive(Error, Debug)]
pub enum ReconError {
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("Unknown check type: {0}")]
    UnknownCheckType(String),

    #[error("Unknown severity: {0}")]
    UnknownSeverity(String),

    #[error("Unknown validation mode: {0}")]
    UnknownMode(String),
}
