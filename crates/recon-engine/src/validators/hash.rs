//! Canonical record hashing and the streaming hash diff

use chrono::Utc;
use recon_common::hashing::{digest_hex, HashAlgorithm};
use recon_common::{CheckType, EntityType, Severity};
use tracing::{debug, instrument};

use super::KeyedStream;
use crate::entity::{descriptor, FieldValue, FIELD_SEPARATOR};
use crate::error::ValidationError;
use crate::models::{Discrepancy, DiscrepancyKind, RecordHash, ResultStatus, ValidationResult};
use crate::normalize::{NormalizedRecord, NormalizedStream};
use crate::source::Side;

/// Upper bound on hashes kept per result for the audit table
pub const MAX_CAPTURED_HASHES: usize = 10_000;

/// Stable hash over a fixed set of comparison fields
///
/// The hasher sorts its field list itself, so the order in which fields are
/// declared never changes a hash.
#[derive(Debug, Clone)]
pub struct CanonicalHasher {
    fields: Vec<&'static str>,
    algorithm: HashAlgorithm,
}

impl CanonicalHasher {
    pub fn new(fields: &[&'static str]) -> Self {
        let mut fields = fields.to_vec();
        fields.sort_unstable();
        fields.dedup();
        Self {
            fields,
            algorithm: HashAlgorithm::Sha256,
        }
    }

    pub fn for_entity(entity: EntityType) -> Self {
        Self::new(descriptor(entity).comparison)
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }

    /// `name=value` pairs in canonical field order joined by the unit separator
    pub fn canonical_string(&self, record: &NormalizedRecord) -> Result<String, ValidationError> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for name in &self.fields {
            let value = record
                .get(name)
                .unwrap_or(&FieldValue::Null)
                .canonical()
                .map_err(|message| ValidationError::HashComputation {
                    record_id: record.id.clone(),
                    message: format!("field '{name}': {message}"),
                })?;
            parts.push(format!("{name}={value}"));
        }
        Ok(parts.join(&FIELD_SEPARATOR.to_string()))
    }

    pub fn hash(&self, record: &NormalizedRecord) -> Result<String, ValidationError> {
        let canonical = self.canonical_string(record)?;
        Ok(digest_hex(self.algorithm, canonical.as_bytes()))
    }
}

/// Classification tallies for one diff
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DiffTally {
    matched: u64,
    changed: u64,
    missing_in_local: u64,
    missing_in_source: u64,
    hash_errors: u64,
}

impl DiffTally {
    fn mismatches(&self) -> u64 {
        self.changed + self.missing_in_local + self.missing_in_source
    }

    fn keys(&self) -> u64 {
        self.matched + self.mismatches()
    }
}

/// Sorted-merge diff of two primary-key-ordered streams
///
/// Only the current head of each stream is held in memory.
#[derive(Debug, Clone)]
pub struct HashChangeDetector {
    hasher: CanonicalHasher,
    capture_hashes: bool,
}

/// A record paired with its hash, or the reason it has none
struct Hashed {
    record: NormalizedRecord,
    hash: Result<String, ValidationError>,
}

impl HashChangeDetector {
    pub fn new(hasher: CanonicalHasher) -> Self {
        Self {
            hasher,
            capture_hashes: false,
        }
    }

    /// Keep the hashes of mismatched records on the result for the audit table
    ///
    /// At most [`MAX_CAPTURED_HASHES`] are kept; matched records are never kept.
    pub fn capture_hashes(mut self, capture: bool) -> Self {
        self.capture_hashes = capture;
        self
    }

    async fn next_hashed(&self, stream: &mut KeyedStream) -> Result<Option<Hashed>, ValidationError> {
        Ok(stream.next().await?.map(|record| Hashed {
            hash: self.hasher.hash(&record),
            record,
        }))
    }

    #[instrument(skip_all, fields(entity_type = %entity))]
    pub async fn diff(
        &self,
        entity: EntityType,
        source: NormalizedStream,
        local: NormalizedStream,
    ) -> Result<ValidationResult, ValidationError> {
        let mut result = ValidationResult::new(entity, CheckType::Hash);
        let mut tally = DiffTally::default();
        let mut source = KeyedStream::new(Side::Source, source);
        let mut local = KeyedStream::new(Side::Local, local);

        let mut s = self.next_hashed(&mut source).await?;
        let mut l = self.next_hashed(&mut local).await?;

        loop {
            let order = match (&s, &l) {
                (None, None) => break,
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(a), Some(b)) => a.record.id.cmp(&b.record.id),
            };

            match order {
                std::cmp::Ordering::Less => {
                    if let Some(only) = s.take() {
                        self.observe(Side::Source, &only, &mut result, &mut tally);
                        self.capture(entity, Side::Source, &only, &mut result);
                        tally.missing_in_local += 1;
                        result.push_discrepancy(
                            Discrepancy::new(DiscrepancyKind::MissingInLocal, Severity::Blocking)
                                .record(&only.record.id)
                                .expected(only.hash.as_deref().unwrap_or("present")),
                        );
                    }
                    s = self.next_hashed(&mut source).await?;
                },
                std::cmp::Ordering::Greater => {
                    if let Some(only) = l.take() {
                        self.observe(Side::Local, &only, &mut result, &mut tally);
                        self.capture(entity, Side::Local, &only, &mut result);
                        tally.missing_in_source += 1;
                        result.push_discrepancy(
                            Discrepancy::new(DiscrepancyKind::MissingInSource, Severity::Blocking)
                                .record(&only.record.id)
                                .actual(only.hash.as_deref().unwrap_or("present")),
                        );
                    }
                    l = self.next_hashed(&mut local).await?;
                },
                std::cmp::Ordering::Equal => {
                    if let (Some(a), Some(b)) = (s.take(), l.take()) {
                        self.observe(Side::Source, &a, &mut result, &mut tally);
                        self.observe(Side::Local, &b, &mut result, &mut tally);
                        match (&a.hash, &b.hash) {
                            (Ok(expected), Ok(actual)) if expected == actual => tally.matched += 1,
                            (Ok(expected), Ok(actual)) => {
                                tally.changed += 1;
                                self.capture(entity, Side::Source, &a, &mut result);
                                self.capture(entity, Side::Local, &b, &mut result);
                                result.push_discrepancy(
                                    Discrepancy::new(DiscrepancyKind::Changed, Severity::Warning)
                                        .record(&a.record.id)
                                        .expected(expected)
                                        .actual(actual),
                                );
                            },
                            // already tallied as a hash error; the key is neither matched nor changed
                            _ => {},
                        }
                    }
                    s = self.next_hashed(&mut source).await?;
                    l = self.next_hashed(&mut local).await?;
                },
            }
        }

        let keys = tally.keys();
        let mismatch_rate = tally.mismatches() as f64 / keys.max(1) as f64;
        result.set_metric("source_records", source.yielded() as f64);
        result.set_metric("local_records", local.yielded() as f64);
        result.set_metric("matched", tally.matched as f64);
        result.set_metric("changed", tally.changed as f64);
        result.set_metric("missing_in_local", tally.missing_in_local as f64);
        result.set_metric("missing_in_source", tally.missing_in_source as f64);
        result.set_metric("hash_errors", tally.hash_errors as f64);
        result.set_metric("mismatch_rate", mismatch_rate);

        if tally.mismatches() > 0 {
            result.status = ResultStatus::Fail;
        }

        debug!(
            matched = tally.matched,
            changed = tally.changed,
            missing_in_local = tally.missing_in_local,
            missing_in_source = tally.missing_in_source,
            hash_errors = tally.hash_errors,
            "Hash diff complete"
        );

        Ok(result)
    }

    /// Tally a failure to compute a hash
    fn observe(&self, side: Side, item: &Hashed, result: &mut ValidationResult, tally: &mut DiffTally) {
        if let Err(e) = &item.hash {
            tally.hash_errors += 1;
            result.push_discrepancy(
                Discrepancy::new(DiscrepancyKind::HashError, Severity::Info)
                    .record(&item.record.id)
                    .note(format!("{side}: {e}")),
            );
        }
    }

    fn capture(&self, entity: EntityType, side: Side, item: &Hashed, result: &mut ValidationResult) {
        if !self.capture_hashes || result.record_hashes.len() >= MAX_CAPTURED_HASHES {
            return;
        }
        if let Ok(hash) = &item.hash {
            result.record_hashes.push(RecordHash {
                run_id: uuid::Uuid::nil(),
                entity_type: entity,
                record_id: item.record.id.clone(),
                side,
                hash: hash.clone(),
                computed_at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::validators::test_support::{normalize, stream};
    use proptest::prelude::*;
    use serde_json::json;

    fn org(id: &str, name: &str) -> serde_json::Value {
        json!({"Id": id, "Name": name, "NumberOfEmployees": 10})
    }

    fn local_org(id: &str, name: &str) -> serde_json::Value {
        json!({"id": id, "name": name, "employee_count": 10})
    }

    fn detector() -> HashChangeDetector {
        HashChangeDetector::new(CanonicalHasher::for_entity(EntityType::Organization))
    }

    #[test]
    fn test_hasher_sorts_its_fields() {
        let a = CanonicalHasher::new(&["name", "city", "state"]);
        let b = CanonicalHasher::new(&["state", "name", "city"]);
        assert_eq!(a.fields(), b.fields());

        let record = normalize(EntityType::Organization, org("o1", "Acme"));
        assert_eq!(a.hash(&record).unwrap(), b.hash(&record).unwrap());
        assert_eq!(a.canonical_string(&record).unwrap(), "city=\u{2400}\u{1f}name=Acme\u{1f}state=\u{2400}");
    }

    #[test]
    fn test_crm_and_local_shapes_hash_alike() {
        let hasher = CanonicalHasher::for_entity(EntityType::Organization);
        let source = normalize(EntityType::Organization, org("o1", "Acme"));
        let local = normalize(EntityType::Organization, local_org("o1", "Acme"));
        assert_eq!(hasher.hash(&source).unwrap(), hasher.hash(&local).unwrap());
    }

    #[test]
    fn test_non_finite_value_is_a_hash_error() {
        let hasher = CanonicalHasher::new(&["total_hours"]);
        let mut record = normalize(EntityType::Volunteer, json!({"Id": "v1"}));
        record.fields = vec![("total_hours", FieldValue::Decimal(f64::INFINITY))];
        assert!(matches!(
            hasher.hash(&record),
            Err(ValidationError::HashComputation { ref record_id, .. }) if record_id == "v1"
        ));
    }

    #[tokio::test]
    async fn test_diff_classifies_every_key() {
        let source = stream(
            EntityType::Organization,
            Side::Source,
            vec![org("a", "A"), org("b", "B"), org("c", "C"), org("e", "E")],
        );
        let local = stream(
            EntityType::Organization,
            Side::Local,
            vec![local_org("a", "A"), local_org("c", "C2"), local_org("d", "D"), local_org("e", "E")],
        );

        let result = detector().diff(EntityType::Organization, source, local).await.unwrap();

        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.metric("matched"), Some(2.0));
        assert_eq!(result.metric("changed"), Some(1.0));
        assert_eq!(result.metric("missing_in_local"), Some(1.0));
        assert_eq!(result.metric("missing_in_source"), Some(1.0));
        assert_eq!(result.metric("mismatch_rate"), Some(3.0 / 5.0));

        let kinds: Vec<_> = result
            .discrepancies
            .iter()
            .map(|d| (d.kind, d.record_id.clone().unwrap(), d.severity))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (DiscrepancyKind::MissingInLocal, "b".to_string(), Severity::Blocking),
                (DiscrepancyKind::Changed, "c".to_string(), Severity::Warning),
                (DiscrepancyKind::MissingInSource, "d".to_string(), Severity::Blocking),
            ]
        );
    }

    #[tokio::test]
    async fn test_identical_sides_match() {
        let source = stream(EntityType::Organization, Side::Source, vec![org("a", "A"), org("b", "B")]);
        let local = stream(EntityType::Organization, Side::Local, vec![local_org("a", "A"), local_org("b", "B")]);

        let result = detector().diff(EntityType::Organization, source, local).await.unwrap();
        assert_eq!(result.status, ResultStatus::Pass);
        assert_eq!(result.metric("mismatch_rate"), Some(0.0));
        assert!(result.discrepancies.is_empty());
    }

    #[tokio::test]
    async fn test_empty_sides_pass() {
        let result = detector()
            .diff(
                EntityType::Organization,
                stream(EntityType::Organization, Side::Source, vec![]),
                stream(EntityType::Organization, Side::Local, vec![]),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ResultStatus::Pass);
        assert_eq!(result.metric("mismatch_rate"), Some(0.0));
    }

    #[tokio::test]
    async fn test_unsorted_input_is_an_error() {
        let source = stream(EntityType::Organization, Side::Source, vec![org("b", "B"), org("a", "A")]);
        let local = stream(EntityType::Organization, Side::Local, vec![local_org("a", "A"), local_org("b", "B")]);

        let err = detector().diff(EntityType::Organization, source, local).await.unwrap_err();
        assert!(matches!(err, ValidationError::OrderViolation { side: Side::Source, .. }));
    }

    #[tokio::test]
    async fn test_only_mismatched_hashes_are_captured() {
        let source = stream(EntityType::Organization, Side::Source, vec![org("a", "A"), org("b", "B"), org("c", "C")]);
        let local = stream(EntityType::Organization, Side::Local, vec![local_org("a", "A"), local_org("b", "B2")]);

        let result = detector()
            .capture_hashes(true)
            .diff(EntityType::Organization, source, local)
            .await
            .unwrap();

        let captured: Vec<_> = result.record_hashes.iter().map(|h| (h.record_id.as_str(), h.side)).collect();
        assert_eq!(captured, vec![("b", Side::Source), ("b", Side::Local), ("c", Side::Source)]);
        assert_ne!(result.record_hashes[0].hash, result.record_hashes[1].hash);
    }

    #[tokio::test]
    async fn test_captured_hashes_are_capped() {
        let many = MAX_CAPTURED_HASHES + 5;
        let source = stream(
            EntityType::Organization,
            Side::Source,
            (0..many).map(|i| org(&format!("{i:06}"), "A")).collect(),
        );
        let local = stream(EntityType::Organization, Side::Local, vec![]);

        let result = detector()
            .capture_hashes(true)
            .diff(EntityType::Organization, source, local)
            .await
            .unwrap();
        assert_eq!(result.metric("missing_in_local"), Some(many as f64));
        assert_eq!(result.record_hashes.len(), MAX_CAPTURED_HASHES);
    }

    #[tokio::test]
    async fn test_text_drift_changes_the_hash() {
        let source = stream(
            EntityType::Organization,
            Side::Source,
            vec![org("a", "Acme "), json!({"Id": "b", "Name": "", "NumberOfEmployees": 10})],
        );
        let local = stream(
            EntityType::Organization,
            Side::Local,
            vec![local_org("a", "Acme"), json!({"id": "b", "name": null, "employee_count": 10})],
        );

        let result = detector().diff(EntityType::Organization, source, local).await.unwrap();
        assert_eq!(result.status, ResultStatus::Fail);
        assert_eq!(result.metric("changed"), Some(2.0));
        assert_eq!(result.metric("matched"), Some(0.0));
    }

    #[test]
    fn test_separator_inside_text_cannot_collide() {
        let hasher = CanonicalHasher::new(&["city", "name"]);
        let mut a = normalize(EntityType::Organization, org("o1", "z"));
        a.fields = vec![
            ("city", FieldValue::Text("x\u{1f}name=y".into())),
            ("name", FieldValue::Text("z".into())),
        ];
        let mut b = a.clone();
        b.fields = vec![
            ("city", FieldValue::Text("x".into())),
            ("name", FieldValue::Text("y\u{1f}name=z".into())),
        ];
        assert_ne!(hasher.hash(&a).unwrap(), hasher.hash(&b).unwrap());

        let mut marker = a.clone();
        marker.fields = vec![("name", FieldValue::Text("\u{2400}".into()))];
        let mut null = a.clone();
        null.fields = vec![("name", FieldValue::Null)];
        assert_ne!(hasher.hash(&marker).unwrap(), hasher.hash(&null).unwrap());
    }

    proptest! {
        #[test]
        fn prop_field_declaration_order_never_changes_hash(
            name in "[A-Za-z ]{0,12}",
            city in proptest::option::of("[A-Za-z]{1,8}"),
            employees in proptest::option::of(0i64..10_000),
            rotate in 0usize..5,
        ) {
            let mut fields = descriptor(EntityType::Organization).comparison.to_vec();
            fields.rotate_left(rotate);
            let reversed: Vec<_> = fields.iter().rev().copied().collect();

            let source = normalize(
                EntityType::Organization,
                json!({"Id": "o1", "Name": name, "BillingCity": city, "NumberOfEmployees": employees}),
            );
            let local = normalize(
                EntityType::Organization,
                json!({"employee_count": employees, "city": city, "name": name, "id": "o1"}),
            );

            let a = CanonicalHasher::new(&fields).hash(&source).unwrap();
            let b = CanonicalHasher::new(&reversed).hash(&local).unwrap();
            prop_assert_eq!(a, b);
        }
    }
}
