//! Row-count comparison

use chrono::{DateTime, Utc};
use recon_common::{CheckType, EntityType, Severity};
use tracing::debug;

use crate::error::ValidationError;
use crate::models::{Discrepancy, DiscrepancyKind, ResultStatus, ValidationResult};
use crate::source::DataSource;

/// Normalized difference between two counts
///
/// `|source - local| / max(source, 1)`; symmetric in the sense that equal counts
/// always yield 0.
pub fn variance(source: u64, local: u64) -> f64 {
    source.abs_diff(local) as f64 / source.max(1) as f64
}

#[derive(Debug, Clone, Copy)]
pub struct RowCountValidator {
    threshold: f64,
}

impl RowCountValidator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Judge a pair of counts
    pub fn evaluate(&self, entity: EntityType, source_count: u64, local_count: u64) -> ValidationResult {
        let variance = variance(source_count, local_count);
        let mut result = ValidationResult::new(entity, CheckType::Count);
        result.set_metric("source_count", source_count as f64);
        result.set_metric("local_count", local_count as f64);
        result.set_metric("variance", variance);
        result.set_metric("threshold", self.threshold);

        if variance > self.threshold {
            result.status = ResultStatus::Fail;
            result.push_discrepancy(
                Discrepancy::new(DiscrepancyKind::CountVariance, Severity::Blocking)
                    .expected(source_count)
                    .actual(local_count)
                    .note(format!("variance {variance:.4} exceeds threshold {}", self.threshold)),
            );
        }

        result
    }

    pub async fn run(
        &self,
        entity: EntityType,
        source: &dyn DataSource,
        local: &dyn DataSource,
        since: Option<DateTime<Utc>>,
    ) -> Result<ValidationResult, ValidationError> {
        let (source_count, local_count) = futures::try_join!(source.count(entity, since), local.count(entity, since))?;
        debug!(entity_type = %entity, source_count, local_count, "Counted records");
        Ok(self.evaluate(entity, source_count, local_count))
    }
}
