//! Schema drift detection
//!
//! The declared CRM schema is compared against the fields and value types seen
//! in a sample of raw source records. Drift is reported, not fatal: findings are
//! warnings unless the policy escalates them to blocking, and only blocking
//! findings fail the check.

use recon_common::{CheckType, EntityType, Severity};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::config::SchemaPolicy;
use crate::entity::{descriptor, EntityDescriptor, FieldType};
use crate::error::ValidationError;
use crate::models::{Discrepancy, DiscrepancyKind, ResultStatus, ValidationResult};
use crate::source::{DataSource, RawRecord};

/// Drift findings handed to the checks that run after schema detection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaFindings {
    /// Canonical names of declared fields absent from every sampled record
    pub removed: Vec<&'static str>,
    /// Source names of undeclared fields
    pub added: Vec<String>,
    /// Canonical names of fields whose observed type contradicts the declaration
    pub type_changed: Vec<&'static str>,
}

impl SchemaFindings {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.type_changed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SchemaDriftDetector {
    descriptor: &'static EntityDescriptor,
    policy: SchemaPolicy,
}

impl SchemaDriftDetector {
    pub fn new(entity: EntityType, policy: SchemaPolicy) -> Self {
        Self {
            descriptor: descriptor(entity),
            policy,
        }
    }

    pub async fn run(&self, source: &dyn DataSource) -> Result<(ValidationResult, SchemaFindings), ValidationError> {
        let sample = source
            .sample(self.descriptor.entity_type, self.policy.sample_size)
            .await?;
        Ok(self.analyze(&sample))
    }

    /// Compare the declared schema against a sample
    pub fn analyze(&self, sample: &[RawRecord]) -> (ValidationResult, SchemaFindings) {
        let entity = self.descriptor.entity_type;
        let mut result = ValidationResult::new(entity, CheckType::Schema);
        let mut findings = SchemaFindings::default();

        let mut present: BTreeSet<&str> = BTreeSet::new();
        let mut observed: BTreeMap<&str, BTreeSet<FieldType>> = BTreeMap::new();
        for record in sample {
            for (name, value) in record {
                present.insert(name.as_str());
                if let Some(t) = FieldType::of_json(value) {
                    observed.entry(name.as_str()).or_default().insert(t);
                }
            }
        }

        result.set_metric("sample_size", sample.len() as f64);
        result.set_metric("declared_fields", self.descriptor.schema.len() as f64);

        if sample.is_empty() {
            // nothing to compare against
            result.set_metric("observed_fields", 0.0);
            return (result, findings);
        }

        let severity = self.policy.severity;

        for field in self.descriptor.schema {
            if !present.contains(field.source_name) {
                findings.removed.push(field.canonical);
                result.push_discrepancy(
                    Discrepancy::new(DiscrepancyKind::FieldRemoved, severity)
                        .field(field.source_name)
                        .expected(field.field_type)
                        .note(format!("absent from all {} sampled records", sample.len())),
                );
                continue;
            }

            let types = observed.get(field.source_name).cloned().unwrap_or_default();
            let unexpected: Vec<_> = types.iter().filter(|t| !field.field_type.accepts(**t)).collect();
            if !unexpected.is_empty() {
                findings.type_changed.push(field.canonical);
                let actual = types.iter().map(FieldType::as_str).collect::<Vec<_>>().join("|");
                result.push_discrepancy(
                    Discrepancy::new(DiscrepancyKind::TypeChanged, severity)
                        .field(field.source_name)
                        .expected(field.field_type)
                        .actual(actual),
                );
            }
        }

        let declared: BTreeSet<&str> = self.descriptor.schema.iter().map(|f| f.source_name).collect();
        let added = present.iter().filter(|name| {
            !declared.contains(*name)
                && !self.descriptor.is_system_field(name)
                && !self.policy.ignored_fields.iter().any(|i| i == *name)
        });
        for name in added {
            findings.added.push(name.to_string());
            let types = observed
                .get(name)
                .map(|t| t.iter().map(FieldType::as_str).collect::<Vec<_>>().join("|"))
                .unwrap_or_else(|| "null".to_string());
            result.push_discrepancy(
                Discrepancy::new(DiscrepancyKind::FieldAdded, severity)
                    .field(*name)
                    .actual(types),
            );
        }

        result.set_metric("observed_fields", present.len() as f64);
        result.set_metric("fields_added", findings.added.len() as f64);
        result.set_metric("fields_removed", findings.removed.len() as f64);
        result.set_metric("types_changed", findings.type_changed.len() as f64);

        if result.has_blocking() {
            result.status = ResultStatus::Fail;
        }

        if !findings.is_empty() {
            warn!(
                entity_type = %entity,
                removed = ?findings.removed,
                added = ?findings.added,
                type_changed = ?findings.type_changed,
                %severity,
                "Schema drift detected"
            );
        }

        (result, findings)
    }
}
