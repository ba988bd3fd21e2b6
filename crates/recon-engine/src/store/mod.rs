//! Run persistence
//!
//! The store is the engine's only write target. Layout:
//!
//! - `validation_runs`: one row per run, updated until terminal
//! - `validation_results`: one row per (run, entity type, check type)
//! - `discrepancies`: rows of one result
//! - `record_hashes`: per-run audit of computed hashes
//!
//! [`ValidationRunStore::save_results`] writes everything a finished run holds in
//! one unit, so a retried save never leaves half a run behind.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_common::{CheckType, EntityType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{RunSummary, ValidationRun};

/// One historical value of a result metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub value: f64,
}

#[async_trait]
pub trait ValidationRunStore: Send + Sync {
    /// Persist a newly started run header
    async fn create_run(&self, run: &ValidationRun) -> Result<(), StoreError>;

    /// Persist every result, discrepancy and record hash of a finished run, and its terminal header
    async fn save_results(&self, run: &ValidationRun) -> Result<(), StoreError>;

    /// Update only the run header
    async fn finish_run(&self, run: &ValidationRun) -> Result<(), StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<ValidationRun, StoreError>;

    /// Most recent runs first
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError>;

    /// The latest `limit` values of a metric, oldest first
    async fn metric_history(
        &self,
        entity: EntityType,
        check: CheckType,
        metric: &str,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, StoreError>;
}

/// Parse a stored enum column
pub(crate) fn parse_column<T>(column: &str, value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StoreError::Corrupt(format!("{column} '{value}': {e}")))
}
