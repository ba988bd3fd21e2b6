//! Run, result and discrepancy model
//!
//! A [`ValidationRun`] owns its results and is the only place its status can
//! change. The status is derived from the recorded results in
//! [`ValidationRun::finish`] and can never be set directly.

use chrono::{DateTime, Utc};
use recon_common::{CheckType, EntityType, Severity, ValidationMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::source::Side;

/// Lifecycle of a reconciliation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// Every check passed
    Completed,
    /// At least one check failed or errored, and every result was persisted
    PartialFailure,
    /// Results could not be persisted
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::PartialFailure | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "partial_failure" => Ok(RunStatus::PartialFailure),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pass,
    /// The check ran and found a data-quality problem
    Fail,
    /// The check could not tell
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Pass => "pass",
            ResultStatus::Fail => "fail",
            ResultStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(ResultStatus::Pass),
            "fail" => Ok(ResultStatus::Fail),
            "error" => Ok(ResultStatus::Error),
            other => Err(format!("unknown result status '{other}'")),
        }
    }
}

/// Classification of a discrepancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    CountVariance,
    Changed,
    MissingInLocal,
    MissingInSource,
    IncompleteField,
    ToleranceExceeded,
    ValueMismatch,
    FieldAdded,
    FieldRemoved,
    TypeChanged,
    HashError,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::CountVariance => "count_variance",
            DiscrepancyKind::Changed => "changed",
            DiscrepancyKind::MissingInLocal => "missing_in_local",
            DiscrepancyKind::MissingInSource => "missing_in_source",
            DiscrepancyKind::IncompleteField => "incomplete_field",
            DiscrepancyKind::ToleranceExceeded => "tolerance_exceeded",
            DiscrepancyKind::ValueMismatch => "value_mismatch",
            DiscrepancyKind::FieldAdded => "field_added",
            DiscrepancyKind::FieldRemoved => "field_removed",
            DiscrepancyKind::TypeChanged => "type_changed",
            DiscrepancyKind::HashError => "hash_error",
        }
    }
}

impl std::fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DiscrepancyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "count_variance" => DiscrepancyKind::CountVariance,
            "changed" => DiscrepancyKind::Changed,
            "missing_in_local" => DiscrepancyKind::MissingInLocal,
            "missing_in_source" => DiscrepancyKind::MissingInSource,
            "incomplete_field" => DiscrepancyKind::IncompleteField,
            "tolerance_exceeded" => DiscrepancyKind::ToleranceExceeded,
            "value_mismatch" => DiscrepancyKind::ValueMismatch,
            "field_added" => DiscrepancyKind::FieldAdded,
            "field_removed" => DiscrepancyKind::FieldRemoved,
            "type_changed" => DiscrepancyKind::TypeChanged,
            "hash_error" => DiscrepancyKind::HashError,
            other => return Err(format!("unknown discrepancy kind '{other}'")),
        })
    }
}

/// A single recorded mismatch, always attached to a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub id: Uuid,
    pub result_id: Uuid,
    pub kind: DiscrepancyKind,
    pub severity: Severity,
    /// Canonical record id; `None` for aggregate and schema discrepancies
    pub record_id: Option<String>,
    pub field_name: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub note: Option<String>,
}

impl Discrepancy {
    pub fn new(kind: DiscrepancyKind, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            result_id: Uuid::nil(),
            kind,
            severity,
            record_id: None,
            field_name: None,
            expected: None,
            actual: None,
            note: None,
        }
    }

    pub fn record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn field(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }

    pub fn expected(mut self, expected: impl ToString) -> Self {
        self.expected = Some(expected.to_string());
        self
    }

    pub fn actual(mut self, actual: impl ToString) -> Self {
        self.actual = Some(actual.to_string());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Hash of one record on one side, kept per run for audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHash {
    pub run_id: Uuid,
    pub entity_type: EntityType,
    pub record_id: String,
    pub side: Side,
    pub hash: String,
    pub computed_at: DateTime<Utc>,
}

/// Outcome of one check for one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub id: Uuid,
    pub run_id: Uuid,
    pub entity_type: EntityType,
    pub check_type: CheckType,
    pub status: ResultStatus,
    pub metrics: BTreeMap<String, f64>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub discrepancies: Vec<Discrepancy>,
    #[serde(skip)]
    pub record_hashes: Vec<RecordHash>,
}

impl ValidationResult {
    /// A passing result with no metrics yet
    pub fn new(entity_type: EntityType, check_type: CheckType) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: Uuid::nil(),
            entity_type,
            check_type,
            status: ResultStatus::Pass,
            metrics: BTreeMap::new(),
            error_message: None,
            duration_ms: 0,
            created_at: Utc::now(),
            discrepancies: Vec::new(),
            record_hashes: Vec::new(),
        }
    }

    /// A result for a check that could not complete
    pub fn error(entity_type: EntityType, check_type: CheckType, err: &impl std::fmt::Display) -> Self {
        Self {
            status: ResultStatus::Error,
            error_message: Some(err.to_string()),
            ..Self::new(entity_type, check_type)
        }
    }

    pub fn set_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn push_discrepancy(&mut self, mut discrepancy: Discrepancy) {
        discrepancy.result_id = self.id;
        self.discrepancies.push(discrepancy);
    }

    pub fn has_blocking(&self) -> bool {
        self.discrepancies.iter().any(|d| d.severity == Severity::Blocking)
    }

    /// Discrepancy counts per kind
    pub fn classification(&self) -> BTreeMap<DiscrepancyKind, usize> {
        let mut counts = BTreeMap::new();
        for d in &self.discrepancies {
            *counts.entry(d.kind).or_insert(0) += 1;
        }
        counts
    }
}

/// Attempted transition on a run in the wrong state
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Run {run_id} is {status}, cannot {action}")]
pub struct TransitionError {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub action: &'static str,
}

/// Persisted header of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub id: Uuid,
    pub entity_types: Vec<EntityType>,
    pub mode: ValidationMode,
    pub triggered_by: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub error_message: Option<String>,
}

/// One reconciliation run and its results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRun {
    pub id: Uuid,
    pub entity_types: Vec<EntityType>,
    pub mode: ValidationMode,
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub error_message: Option<String>,
    status: RunStatus,
    results: Vec<ValidationResult>,
}

impl ValidationRun {
    pub fn new(entity_types: Vec<EntityType>, mode: ValidationMode, triggered_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_types,
            mode,
            triggered_by: triggered_by.into(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            cancelled: false,
            error_message: None,
            status: RunStatus::Pending,
            results: Vec::new(),
        }
    }

    /// Rebuild a run from persisted state
    pub fn restore(header: RunHeader, mut results: Vec<ValidationResult>) -> Self {
        sort_results(&mut results);
        Self {
            id: header.id,
            entity_types: header.entity_types,
            mode: header.mode,
            triggered_by: header.triggered_by,
            created_at: header.created_at,
            started_at: header.started_at,
            completed_at: header.completed_at,
            cancelled: header.cancelled,
            error_message: header.error_message,
            status: header.status,
            results,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn results(&self) -> &[ValidationResult] {
        &self.results
    }

    pub fn header(&self) -> RunHeader {
        RunHeader {
            id: self.id,
            entity_types: self.entity_types.clone(),
            mode: self.mode,
            triggered_by: self.triggered_by.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            cancelled: self.cancelled,
            error_message: self.error_message.clone(),
        }
    }

    fn guard(&self, expected: RunStatus, action: &'static str) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(TransitionError {
                run_id: self.id,
                status: self.status,
                action,
            })
        }
    }

    /// `Pending -> Running`
    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.guard(RunStatus::Pending, "start")?;
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Attach a finished result to a running run
    pub fn record(&mut self, mut result: ValidationResult) -> Result<(), TransitionError> {
        self.guard(RunStatus::Running, "record results")?;
        result.run_id = self.id;
        for hash in &mut result.record_hashes {
            hash.run_id = self.id;
        }
        self.results.push(result);
        Ok(())
    }

    /// `Running -> Completed | PartialFailure`, derived from the results
    pub fn finish(&mut self, cancelled: bool) -> Result<RunStatus, TransitionError> {
        self.guard(RunStatus::Running, "finish")?;
        sort_results(&mut self.results);
        self.cancelled = cancelled;
        self.status = aggregate_status(&self.results, cancelled);
        self.completed_at = Some(Utc::now());
        Ok(self.status)
    }

    /// `* -> Failed`
    ///
    /// The only transition allowed out of a derived status: a finished run whose
    /// results cannot be persisted is failed rather than completed.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        if self.status == RunStatus::Failed {
            return Err(TransitionError {
                run_id: self.id,
                status: self.status,
                action: "fail",
            });
        }
        self.status = RunStatus::Failed;
        self.error_message = Some(message.into());
        self.completed_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    pub fn summary(&self) -> RunSummary {
        let count = |status| self.results.iter().filter(|r| r.status == status).count();
        let discrepancies = self.results.iter().map(|r| r.discrepancies.len()).sum();
        let blocking = self
            .results
            .iter()
            .flat_map(|r| &r.discrepancies)
            .filter(|d| d.severity == Severity::Blocking)
            .count();

        RunSummary {
            run_id: self.id,
            status: self.status,
            mode: self.mode,
            entity_types: self.entity_types.clone(),
            triggered_by: self.triggered_by.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            cancelled: self.cancelled,
            results_total: self.results.len(),
            passed: count(ResultStatus::Pass),
            failed: count(ResultStatus::Fail),
            errored: count(ResultStatus::Error),
            discrepancies,
            blocking_discrepancies: blocking,
            failing_checks: self
                .results
                .iter()
                .filter(|r| r.status != ResultStatus::Pass)
                .map(|r| format!("{}/{}: {}", r.entity_type, r.check_type, r.status))
                .collect(),
            error_message: self.error_message.clone(),
        }
    }
}

/// Deterministic result order: entity type, then check type
fn sort_results(results: &mut [ValidationResult]) {
    results.sort_by_key(|r| (r.entity_type, r.check_type));
}

/// Run status implied by a set of results
///
/// A cancelled run never reports `Completed`, since some checks did not run.
pub fn aggregate_status(results: &[ValidationResult], cancelled: bool) -> RunStatus {
    if cancelled || results.iter().any(|r| r.status != ResultStatus::Pass) {
        RunStatus::PartialFailure
    } else {
        RunStatus::Completed
    }
}

/// Condensed view of a run for drivers and alerting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub mode: ValidationMode,
    pub entity_types: Vec<EntityType>,
    pub triggered_by: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub results_total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub discrepancies: usize,
    pub blocking_discrepancies: usize,
    /// `entity/check: status` for every non-passing result
    #[serde(default)]
    pub failing_checks: Vec<String>,
    pub error_message: Option<String>,
}

impl RunSummary {
    /// Process exit code for a driver
    ///
    /// `0` all checks passed, `1` data-quality failure, `2` operational failure.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed if self.blocking_discrepancies == 0 => 0,
            RunStatus::Completed | RunStatus::PartialFailure => 1,
            RunStatus::Failed | RunStatus::Pending | RunStatus::Running => 2,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn running_run() -> ValidationRun {
        let mut run = ValidationRun::new(vec![EntityType::Volunteer, EntityType::Event], ValidationMode::Fast, "test");
        run.start().unwrap();
        run
    }

    #[test]
    fn test_all_pass_completes() {
        let mut run = running_run();
        run.record(ValidationResult::new(EntityType::Volunteer, CheckType::Count)).unwrap();
        run.record(ValidationResult::new(EntityType::Event, CheckType::Count)).unwrap();

        assert_eq!(run.finish(false).unwrap(), RunStatus::Completed);
        assert_eq!(run.summary().exit_code(), 0);
    }

    #[test]
    fn test_error_result_is_partial_failure() {
        let mut run = running_run();
        run.record(ValidationResult::new(EntityType::Volunteer, CheckType::Count)).unwrap();
        run.record(ValidationResult::error(EntityType::Event, CheckType::Count, &"timed out"))
            .unwrap();

        assert_eq!(run.finish(false).unwrap(), RunStatus::PartialFailure);
        let summary = run.summary();
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.failing_checks, vec!["event/count: error"]);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_cancelled_run_is_not_completed() {
        let mut run = running_run();
        run.record(ValidationResult::new(EntityType::Volunteer, CheckType::Count)).unwrap();
        assert_eq!(run.finish(true).unwrap(), RunStatus::PartialFailure);
        assert!(run.cancelled);
    }

    #[test]
    fn test_terminal_run_is_immutable() {
        let mut run = running_run();
        run.finish(false).unwrap();

        let err = run
            .record(ValidationResult::new(EntityType::Volunteer, CheckType::Count))
            .unwrap_err();
        assert_eq!(err.status, RunStatus::Completed);
        assert!(run.start().is_err());
        assert!(run.finish(false).is_err());
    }

    #[test]
    fn test_persistence_failure_overrides_status() {
        let mut run = running_run();
        run.record(ValidationResult::new(EntityType::Volunteer, CheckType::Count)).unwrap();
        run.finish(false).unwrap();
        run.fail("store unavailable").unwrap();

        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.summary().exit_code(), 2);
        assert!(run.fail("again").is_err());
    }

    #[test]
    fn test_results_are_sorted_and_linked() {
        let mut run = running_run();
        let mut result = ValidationResult::new(EntityType::Event, CheckType::Hash);
        result.push_discrepancy(Discrepancy::new(DiscrepancyKind::Changed, Severity::Warning).record("e-1"));
        run.record(result).unwrap();
        run.record(ValidationResult::new(EntityType::Volunteer, CheckType::Count)).unwrap();
        run.record(ValidationResult::new(EntityType::Event, CheckType::Schema)).unwrap();
        run.finish(false).unwrap();

        let order: Vec<_> = run.results().iter().map(|r| (r.entity_type, r.check_type)).collect();
        assert_eq!(
            order,
            vec![
                (EntityType::Volunteer, CheckType::Count),
                (EntityType::Event, CheckType::Schema),
                (EntityType::Event, CheckType::Hash),
            ]
        );
        let hash_result = &run.results()[2];
        assert_eq!(hash_result.run_id, run.id);
        assert_eq!(hash_result.discrepancies[0].result_id, hash_result.id);
    }

    #[test]
    fn test_blocking_discrepancy_sets_exit_code() {
        let mut run = running_run();
        let mut result = ValidationResult::new(EntityType::Volunteer, CheckType::Schema);
        result.push_discrepancy(Discrepancy::new(DiscrepancyKind::FieldRemoved, Severity::Blocking));
        run.record(result).unwrap();
        run.finish(false).unwrap();

        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.summary().exit_code(), 1);
    }

    #[test]
    fn test_status_strings_round_trip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::PartialFailure,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert_eq!("changed".parse::<DiscrepancyKind>().unwrap(), DiscrepancyKind::Changed);
    }
}
