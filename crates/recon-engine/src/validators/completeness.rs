//! Required-field completeness

use futures::TryStreamExt;
use recon_common::{CheckType, EntityType, Severity};
use std::collections::BTreeMap;

use crate::config::EntityPolicy;
use crate::entity::descriptor;
use crate::error::ValidationError;
use crate::models::{Discrepancy, DiscrepancyKind, ResultStatus, ValidationResult};
use crate::normalize::{NormalizedRecord, NormalizedStream};

/// Non-blank counts per required field over one record set
#[derive(Debug, Default, Clone)]
struct Tally {
    total: u64,
    present: BTreeMap<&'static str, u64>,
}

impl Tally {
    fn observe(mut self, record: &NormalizedRecord, fields: &[(&'static str, f64)]) -> Self {
        self.total += 1;
        for (name, _) in fields {
            // absent fields and blank text count as null
            if record.get(name).is_some_and(|v| !v.is_blank()) {
                *self.present.entry(name).or_insert(0) += 1;
            }
        }
        self
    }

    /// Fraction of non-null values; an empty set is complete
    fn ratio(&self, field: &str) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.present.get(field).copied().unwrap_or(0) as f64 / self.total as f64
    }

    async fn collect(stream: NormalizedStream, fields: &[(&'static str, f64)]) -> Result<Self, ValidationError> {
        Ok(stream
            .try_fold(Tally::default(), |tally, record| async move { Ok(tally.observe(&record, fields)) })
            .await?)
    }
}

/// Fraction of non-null required fields, locally and at the source
///
/// A field that is incomplete locally while complete at the source was dropped
/// on the way in and is blocking; one the source never had is a warning.
#[derive(Debug, Clone)]
pub struct FieldCompletenessValidator {
    /// Required fields and their thresholds
    fields: Vec<(&'static str, f64)>,
    /// Canonical names the current schema sample no longer carries
    absent_at_source: Vec<&'static str>,
}

impl FieldCompletenessValidator {
    pub fn new(entity: EntityType, policy: &EntityPolicy) -> Self {
        let fields = descriptor(entity)
            .required
            .iter()
            .map(|name| (*name, policy.completeness_for(name)))
            .collect();
        Self {
            fields,
            absent_at_source: Vec::new(),
        }
    }

    /// Fields reported removed by schema drift detection
    pub fn with_absent_fields(mut self, absent: &[&'static str]) -> Self {
        self.absent_at_source = absent.to_vec();
        self
    }

    pub async fn run(
        &self,
        entity: EntityType,
        local: NormalizedStream,
        source: Option<NormalizedStream>,
    ) -> Result<ValidationResult, ValidationError> {
        let local = Tally::collect(local, &self.fields).await?;
        let source = match source {
            Some(stream) => Some(Tally::collect(stream, &self.fields).await?),
            None => None,
        };
        Ok(self.evaluate(entity, &local, source.as_ref()))
    }

    fn evaluate(&self, entity: EntityType, local: &Tally, source: Option<&Tally>) -> ValidationResult {
        let mut result = ValidationResult::new(entity, CheckType::Completeness);
        result.set_metric("local_records", local.total as f64);
        if let Some(source) = source {
            result.set_metric("source_records", source.total as f64);
        }

        for (field, threshold) in &self.fields {
            let observed = local.ratio(field);
            result.set_metric(format!("completeness.{field}"), observed);
            let source_ratio = source.map(|s| s.ratio(field));
            if let Some(ratio) = source_ratio {
                result.set_metric(format!("source_completeness.{field}"), ratio);
            }

            if observed >= *threshold {
                continue;
            }

            result.status = ResultStatus::Fail;
            let dropped_locally = source_ratio.is_some_and(|r| r >= *threshold);
            let severity = if dropped_locally {
                Severity::Blocking
            } else {
                Severity::Warning
            };

            let mut note = match source_ratio {
                Some(r) => format!("source completeness {r:.4}"),
                None => "source not inspected".to_string(),
            };
            if self.absent_at_source.contains(field) {
                note.push_str("; field missing from source schema");
            }

            result.push_discrepancy(
                Discrepancy::new(DiscrepancyKind::IncompleteField, severity)
                    .field(*field)
                    .expected(threshold)
                    .actual(format!("{observed:.4}"))
                    .note(note),
            );
        }

        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::source::Side;
    use crate::validators::test_support::stream;
    use serde_json::json;

    fn validator(threshold: f64) -> FieldCompletenessValidator {
        let policy = EntityPolicy {
            completeness_threshold: threshold,
            ..EntityPolicy::default()
        };
        FieldCompletenessValidator::new(EntityType::Volunteer, &policy)
    }

    fn volunteer(id: &str, email: Option<&str>) -> serde_json::Value {
        json!({"id": id, "first_name": "A", "last_name": "B", "email": email})
    }

    #[tokio::test]
    async fn test_complete_records_pass() {
        let local = stream(
            EntityType::Volunteer,
            Side::Local,
            vec![volunteer("1", Some("a@x.org")), volunteer("2", Some("b@x.org"))],
        );
        let result = validator(1.0).run(EntityType::Volunteer, local, None).await.unwrap();
        assert_eq!(result.status, ResultStatus::Pass);
        assert_eq!(result.metric("completeness.email"), Some(1.0));
    }

    #[tokio::test]
    async fn test_empty_set_is_complete() {
        let local = stream(EntityType::Volunteer, Side::Local, vec![]);
        let result = validator(1.0).run(EntityType::Volunteer, local, None).await.unwrap();
        assert_eq!(result.status, ResultStatus::Pass);
        assert_eq!(result.metric("completeness.first_name"), Some(1.0));
    }

    #[tokio::test]
    async fn test_blank_text_counts_as_missing() {
        let local = stream(
            EntityType::Volunteer,
            Side::Local,
            vec![
                volunteer("1", Some("a@x.org")),
                volunteer("2", Some("")),
                volunteer("3", Some("   ")),
                volunteer("4", None),
            ],
        );
        let result = validator(0.5).run(EntityType::Volunteer, local, None).await.unwrap();
        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.metric("completeness.email"), Some(0.25));
    }

    #[tokio::test]
    async fn test_field_dropped_on_import_is_blocking() {
        let local = stream(
            EntityType::Volunteer,
            Side::Local,
            vec![volunteer("1", None), volunteer("2", Some("b@x.org"))],
        );
        let source = stream(
            EntityType::Volunteer,
            Side::Source,
            vec![
                json!({"Id": "1", "FirstName": "A", "LastName": "B", "Email": "a@x.org"}),
                json!({"Id": "2", "FirstName": "A", "LastName": "B", "Email": "b@x.org"}),
            ],
        );

        let result = validator(0.9).run(EntityType::Volunteer, local, Some(source)).await.unwrap();

        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.discrepancies.len(), 1);
        let d = &result.discrepancies[0];
        assert_eq!(d.kind, DiscrepancyKind::IncompleteField);
        assert_eq!(d.field_name.as_deref(), Some("email"));
        assert_eq!(d.severity, Severity::Blocking);
        assert_eq!(d.actual.as_deref(), Some("0.5000"));
        assert_eq!(result.metric("source_completeness.email"), Some(1.0));
    }

    #[tokio::test]
    async fn test_field_the_source_never_had_is_a_warning() {
        let local = stream(EntityType::Volunteer, Side::Local, vec![volunteer("1", None)]);
        // Email dropped from the CRM payload entirely
        let source = stream(
            EntityType::Volunteer,
            Side::Source,
            vec![json!({"Id": "1", "FirstName": "A", "LastName": "B"})],
        );

        let result = validator(0.9)
            .with_absent_fields(&["email"])
            .run(EntityType::Volunteer, local, Some(source))
            .await
            .unwrap();

        assert_eq!(result.status, ResultStatus::Fail);
        let d = &result.discrepancies[0];
        assert_eq!(d.severity, Severity::Warning);
        assert!(d.note.as_deref().unwrap().contains("missing from source schema"));
    }
}
