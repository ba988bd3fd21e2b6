//! Field-level comparison with numeric and date tolerances

use recon_common::{CheckType, EntityType, Severity};
use std::collections::BTreeMap;
use tracing::instrument;

use super::KeyedStream;
use crate::config::{EntityPolicy, ToleranceRule};
use crate::entity::{descriptor, FieldValue};
use crate::error::ValidationError;
use crate::models::{Discrepancy, DiscrepancyKind, ResultStatus, ValidationResult};
use crate::normalize::{NormalizedRecord, NormalizedStream};
use crate::source::Side;

/// Outcome of comparing one field of one record pair
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldComparison {
    Equal,
    WithinTolerance { difference: f64, allowed: f64 },
    Exceeded { difference: f64, allowed: f64 },
    /// Unequal with no tolerance applicable
    Mismatch,
}

impl FieldComparison {
    pub fn passed(&self) -> bool {
        matches!(self, FieldComparison::Equal | FieldComparison::WithinTolerance { .. })
    }
}

/// Inclusive `difference <= allowed`, forgiving the rounding of `relative * |source|`
fn within(difference: f64, allowed: f64) -> bool {
    difference <= allowed + allowed.abs().max(1.0) * f64::EPSILON * 4.0
}

#[derive(Debug, Clone)]
pub struct ToleranceChecker {
    fields: Vec<&'static str>,
    rules: BTreeMap<String, ToleranceRule>,
}

impl ToleranceChecker {
    pub fn new(entity: EntityType, policy: &EntityPolicy) -> Self {
        Self {
            fields: descriptor(entity).comparison.to_vec(),
            rules: policy.tolerances.clone(),
        }
    }

    /// Compare one field; dates compare in days, timestamps in seconds
    pub fn compare_field(&self, field: &str, source: &FieldValue, local: &FieldValue) -> FieldComparison {
        let rule = self.rules.get(field);
        match (rule, source.as_f64(), local.as_f64()) {
            (Some(rule), Some(s), Some(l)) => {
                let difference = (l - s).abs();
                let allowed = rule.allowed(s);
                if difference == 0.0 {
                    FieldComparison::Equal
                } else if within(difference, allowed) {
                    FieldComparison::WithinTolerance { difference, allowed }
                } else {
                    FieldComparison::Exceeded { difference, allowed }
                }
            },
            _ if source == local => FieldComparison::Equal,
            _ => FieldComparison::Mismatch,
        }
    }

    #[instrument(skip_all, fields(entity_type = %entity))]
    pub async fn run(
        &self,
        entity: EntityType,
        source: NormalizedStream,
        local: NormalizedStream,
    ) -> Result<ValidationResult, ValidationError> {
        let mut result = ValidationResult::new(entity, CheckType::Tolerance);
        let mut failures: BTreeMap<&'static str, u64> = self.fields.iter().map(|f| (*f, 0)).collect();
        let mut records_compared = 0u64;
        let mut unmatched = 0u64;

        let mut source = KeyedStream::new(Side::Source, source);
        let mut local = KeyedStream::new(Side::Local, local);
        let mut s = source.next().await?;
        let mut l = local.next().await?;

        loop {
            match (s.take(), l.take()) {
                (None, None) => break,
                (Some(_), None) => {
                    unmatched += 1;
                    s = source.next().await?;
                },
                (None, Some(_)) => {
                    unmatched += 1;
                    l = local.next().await?;
                },
                (Some(a), Some(b)) => match a.id.cmp(&b.id) {
                    std::cmp::Ordering::Less => {
                        unmatched += 1;
                        s = source.next().await?;
                        l = Some(b);
                    },
                    std::cmp::Ordering::Greater => {
                        unmatched += 1;
                        s = Some(a);
                        l = local.next().await?;
                    },
                    std::cmp::Ordering::Equal => {
                        records_compared += 1;
                        self.compare_records(&a, &b, &mut result, &mut failures);
                        s = source.next().await?;
                        l = local.next().await?;
                    },
                },
            }
        }

        let total_failures: u64 = failures.values().sum();
        for (field, count) in &failures {
            result.set_metric(format!("failures.{field}"), *count as f64);
        }
        result.set_metric("records_compared", records_compared as f64);
        result.set_metric("fields_compared", (records_compared * self.fields.len() as u64) as f64);
        result.set_metric("unmatched_records", unmatched as f64);
        result.set_metric("failure_rate", total_failures as f64 / records_compared.max(1) as f64);

        if total_failures > 0 {
            result.status = ResultStatus::Fail;
        }

        Ok(result)
    }

    fn compare_records(
        &self,
        source: &NormalizedRecord,
        local: &NormalizedRecord,
        result: &mut ValidationResult,
        failures: &mut BTreeMap<&'static str, u64>,
    ) {
        for field in &self.fields {
            let s = source.get(field).unwrap_or(&FieldValue::Null);
            let l = local.get(field).unwrap_or(&FieldValue::Null);
            let comparison = self.compare_field(field, s, l);
            if comparison.passed() {
                continue;
            }

            *failures.entry(*field).or_insert(0) += 1;
            let discrepancy = match comparison {
                FieldComparison::Exceeded { difference, allowed } => {
                    Discrepancy::new(DiscrepancyKind::ToleranceExceeded, Severity::Warning)
                        .note(format!("difference {difference} exceeds allowed {allowed}"))
                },
                _ => Discrepancy::new(DiscrepancyKind::ValueMismatch, Severity::Warning),
            };
            result.push_discrepancy(discrepancy.record(&source.id).field(*field).expected(s).actual(l));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::validators::test_support::stream;
    use chrono::NaiveDate;
    use serde_json::json;

    fn checker() -> ToleranceChecker {
        let mut policy = EntityPolicy::default();
        policy.tolerances.insert("total_hours".to_string(), ToleranceRule::relative(0.005));
        policy
            .tolerances
            .insert("last_volunteer_date".to_string(), ToleranceRule::absolute(1.0));
        ToleranceChecker::new(EntityType::Volunteer, &policy)
    }

    fn hours(v: f64) -> FieldValue {
        FieldValue::Decimal(v)
    }

    #[test]
    fn test_relative_tolerance() {
        let checker = checker();
        assert!(checker.compare_field("total_hours", &hours(5000.0), &hours(5020.0)).passed());
        assert!(!checker.compare_field("total_hours", &hours(5000.0), &hours(5030.0)).passed());
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let checker = checker();
        let cmp = checker.compare_field("total_hours", &hours(5000.0), &hours(5025.0));
        assert!(cmp.passed(), "{cmp:?}");
        let cmp = checker.compare_field("total_hours", &hours(5000.0), &hours(4975.0));
        assert!(cmp.passed(), "{cmp:?}");
    }

    #[test]
    fn test_dates_compare_in_days() {
        let checker = checker();
        let date = |d| FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, d).unwrap());
        assert!(checker.compare_field("last_volunteer_date", &date(1), &date(2)).passed());
        assert!(!checker.compare_field("last_volunteer_date", &date(1), &date(3)).passed());
    }

    #[test]
    fn test_unconfigured_fields_match_exactly() {
        let checker = checker();
        let text = |s: &str| FieldValue::Text(s.to_string());
        assert_eq!(checker.compare_field("email", &text("a@x.org"), &text("a@x.org")), FieldComparison::Equal);
        assert_eq!(
            checker.compare_field("email", &text("a@x.org"), &text("A@x.org")),
            FieldComparison::Mismatch
        );
        assert_eq!(checker.compare_field("email", &text("a@x.org"), &FieldValue::Null), FieldComparison::Mismatch);
    }

    #[test]
    fn test_text_compares_exactly() {
        let checker = checker();
        let text = |s: &str| FieldValue::Text(s.to_string());
        assert_eq!(
            checker.compare_field("last_name", &text("Lovelace "), &text("Lovelace")),
            FieldComparison::Mismatch
        );
        assert_eq!(
            checker.compare_field("last_name", &text("lovelace"), &text("Lovelace")),
            FieldComparison::Mismatch
        );
        assert_eq!(checker.compare_field("title", &text(""), &FieldValue::Null), FieldComparison::Mismatch);
    }

    #[tokio::test]
    async fn test_trailing_whitespace_is_reported() {
        let source = stream(EntityType::Organization, Side::Source, vec![json!({"Id": "o1", "Name": "Acme "})]);
        let local = stream(EntityType::Organization, Side::Local, vec![json!({"id": "o1", "name": "Acme"})]);

        let result = ToleranceChecker::new(EntityType::Organization, &EntityPolicy::default())
            .run(EntityType::Organization, source, local)
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.metric("failures.name"), Some(1.0));
        let d = &result.discrepancies[0];
        assert_eq!(d.kind, DiscrepancyKind::ValueMismatch);
        assert_eq!(d.field_name.as_deref(), Some("name"));
        assert_eq!(d.expected.as_deref(), Some("Acme "));
        assert_eq!(d.actual.as_deref(), Some("Acme"));
    }

    #[test]
    fn test_null_against_value_is_a_mismatch_even_with_tolerance() {
        let checker = checker();
        assert_eq!(
            checker.compare_field("total_hours", &hours(1.0), &FieldValue::Null),
            FieldComparison::Mismatch
        );
    }

    #[tokio::test]
    async fn test_run_counts_failures_per_field() {
        let source = stream(
            EntityType::Volunteer,
            Side::Source,
            vec![
                json!({"Id": "1", "Email": "a@x.org", "Volunteer_Hours__c": 5000.0}),
                json!({"Id": "2", "Email": "b@x.org", "Volunteer_Hours__c": 5000.0}),
                json!({"Id": "3", "Email": "c@x.org"}),
            ],
        );
        let local = stream(
            EntityType::Volunteer,
            Side::Local,
            vec![
                json!({"id": "1", "email": "a@x.org", "total_hours": 5020.0}),
                json!({"id": "2", "email": "B@x.org", "total_hours": 5030.0}),
                json!({"id": "4", "email": "d@x.org"}),
            ],
        );

        let result = checker().run(EntityType::Volunteer, source, local).await.unwrap();

        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.metric("records_compared"), Some(2.0));
        assert_eq!(result.metric("unmatched_records"), Some(2.0));
        assert_eq!(result.metric("failures.total_hours"), Some(1.0));
        assert_eq!(result.metric("failures.email"), Some(1.0));
        assert_eq!(result.metric("failures.first_name"), Some(0.0));

        let kinds: Vec<_> = result.discrepancies.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DiscrepancyKind::ValueMismatch, DiscrepancyKind::ToleranceExceeded]);
        assert!(result.discrepancies.iter().all(|d| d.record_id.as_deref() == Some("2")));
        // field-level drift is a warning; the failed result is what fails the run
        assert!(result.discrepancies.iter().all(|d| d.severity == Severity::Warning));
    }
}
