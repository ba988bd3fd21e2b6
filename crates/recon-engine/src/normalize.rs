//! Record normalization
//!
//! Raw records from either side are mapped onto the typed entity structs at the
//! boundary, then erased into a [`NormalizedRecord`] with a canonical id and a
//! fixed field order. Validators only ever see normalized records.
//!
//! # Record identity
//!
//! The CRM hands out case-sensitive 15-character ids and case-insensitive
//! 18-character ids for the same record, and the local mirror may hold either.
//! Both sides pass through [`canonical_record_id`]:
//!
//! - ids are trimmed
//! - a 15-character alphanumeric id is extended with its 3-character checksum suffix
//! - an 18-character alphanumeric id whose suffix matches its checksum gets the
//!   upper-case suffix
//! - anything else (UUIDs, integers, malformed ids) is kept as trimmed

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use recon_common::EntityType;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::entity::{
    descriptor, EntityDescriptor, EntityRecord, Event, FieldValue, Organization, Student, Teacher, Volunteer,
};
use crate::error::{NormalizeError, SourceError};
use crate::source::{RawRecord, RecordStream, Side};

const CHECKSUM_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ012345";

/// Checksum suffix of a 15-character CRM id
fn checksum_suffix(short_id: &str) -> String {
    short_id
        .as_bytes()
        .chunks(5)
        .map(|chunk| {
            let flags = chunk
                .iter()
                .enumerate()
                .filter(|(_, b)| b.is_ascii_uppercase())
                .fold(0usize, |acc, (i, _)| acc | (1 << i));
            CHECKSUM_ALPHABET[flags] as char
        })
        .collect()
}

/// Canonical form of a record identifier
pub fn canonical_record_id(raw: &str) -> String {
    let id = raw.trim();
    let alphanumeric = id.bytes().all(|b| b.is_ascii_alphanumeric());

    match id.len() {
        15 if alphanumeric => format!("{id}{}", checksum_suffix(id)),
        18 if alphanumeric => {
            let (short, suffix) = id.split_at(15);
            let expected = checksum_suffix(short);
            if suffix.eq_ignore_ascii_case(&expected) {
                format!("{short}{expected}")
            } else {
                id.to_string()
            }
        },
        _ => id.to_string(),
    }
}

/// A typed record erased into canonical id plus ordered fields
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub entity_type: EntityType,
    pub id: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub fields: Vec<(&'static str, FieldValue)>,
}

impl NormalizedRecord {
    fn from_typed<R: EntityRecord>(record: R) -> Self {
        let id = canonical_record_id(record.record_id());
        let updated_at = record.updated_at();
        Self {
            entity_type: R::ENTITY,
            id,
            updated_at,
            fields: record.into_fields(),
        }
    }

    /// Value of a canonical field; `None` when the entity has no such field
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }
}

/// Maps raw records of one entity type onto typed records
#[derive(Debug, Clone, Copy)]
pub struct RecordNormalizer {
    entity: EntityType,
    descriptor: &'static EntityDescriptor,
}

impl RecordNormalizer {
    pub fn new(entity: EntityType) -> Self {
        Self {
            entity,
            descriptor: descriptor(entity),
        }
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    /// Raw primary key of a record, accepting the CRM or the local name
    fn raw_key<'a>(&self, raw: &'a RawRecord) -> Option<&'a Value> {
        [self.descriptor.source_primary_key, "id", self.descriptor.primary_key]
            .iter()
            .find_map(|k| raw.get(*k))
            .filter(|v| match v {
                Value::String(s) => !s.trim().is_empty(),
                Value::Number(_) => true,
                _ => false,
            })
    }

    /// Canonical id of a raw record, if it has a usable primary key
    pub fn key(&self, raw: &RawRecord) -> Option<String> {
        self.raw_key(raw).map(|v| match v {
            Value::String(s) => canonical_record_id(s),
            other => canonical_record_id(&other.to_string()),
        })
    }

    /// Last-modified timestamp of a raw record, from either side's column name
    pub fn updated_at(&self, raw: &RawRecord) -> Option<DateTime<Utc>> {
        [self.descriptor.source_updated_at, self.descriptor.updated_at_column]
            .iter()
            .find_map(|k| raw.get(*k))
            .and_then(Value::as_str)
            .and_then(crate::entity::value::parse_datetime)
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRecord, NormalizeError> {
        let key = match self.raw_key(raw) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(other) => other.to_string(),
            None => {
                return Err(NormalizeError::MissingPrimaryKey {
                    entity_type: self.entity,
                })
            },
        };

        let value = Value::Object(raw.clone());
        let invalid = |e: serde_json::Error| NormalizeError::InvalidField {
            entity_type: self.entity,
            record_id: key.clone(),
            message: e.to_string(),
        };

        Ok(match self.entity {
            EntityType::Volunteer => NormalizedRecord::from_typed(serde_json::from_value::<Volunteer>(value).map_err(invalid)?),
            EntityType::Organization => {
                NormalizedRecord::from_typed(serde_json::from_value::<Organization>(value).map_err(invalid)?)
            },
            EntityType::Event => NormalizedRecord::from_typed(serde_json::from_value::<Event>(value).map_err(invalid)?),
            EntityType::Student => NormalizedRecord::from_typed(serde_json::from_value::<Student>(value).map_err(invalid)?),
            EntityType::Teacher => NormalizedRecord::from_typed(serde_json::from_value::<Teacher>(value).map_err(invalid)?),
        })
    }
}

/// Number of records skipped because they could not be normalized
#[derive(Debug, Clone, Default)]
pub struct SkipCounter(Arc<AtomicU64>);

impl SkipCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Forget earlier skips before the same streams are read again
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

pub type NormalizedStream = BoxStream<'static, Result<NormalizedRecord, SourceError>>;

/// Normalize a raw stream, skipping and tallying bad records
///
/// When `ordered` is false the normalized records are collected and sorted by
/// canonical id before being yielded. Callers pass false whenever the provider's
/// key order may differ from canonical id order.
pub fn normalized_stream(
    normalizer: RecordNormalizer,
    side: Side,
    records: RecordStream,
    ordered: bool,
    skipped: SkipCounter,
) -> NormalizedStream {
    let entity = normalizer.entity();
    let normalized = records.filter_map(move |item| {
        let out = match item {
            Ok(raw) => match normalizer.normalize(&raw) {
                Ok(record) => Some(Ok(record)),
                Err(e) => {
                    warn!(entity_type = %entity, side = %side, error = %e, "Skipping record that failed normalization");
                    skipped.increment();
                    None
                },
            },
            Err(e) => Some(Err(e)),
        };
        futures::future::ready(out)
    });

    if ordered {
        return normalized.boxed();
    }

    stream::once(async move {
        let mut records: Vec<NormalizedRecord> = normalized.try_collect().await?;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok::<_, SourceError>(stream::iter(records.into_iter().map(Ok)))
    })
    .try_flatten()
    .boxed()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn test_short_id_gets_checksum_suffix() {
        assert_eq!(canonical_record_id("001A0000006Vm9r"), "001A0000006Vm9rIAC");
        assert_eq!(canonical_record_id(" 0035e00000AbCdE "), "0035e00000AbCdEAAV");
    }

    #[test]
    fn test_long_id_suffix_is_uppercased() {
        assert_eq!(canonical_record_id("001A0000006Vm9riac"), "001A0000006Vm9rIAC");
        assert_eq!(canonical_record_id("001A0000006Vm9rIAC"), "001A0000006Vm9rIAC");
    }

    #[test]
    fn test_other_ids_are_kept() {
        // wrong checksum
        assert_eq!(canonical_record_id("001A0000006Vm9rZZZ"), "001A0000006Vm9rZZZ");
        assert_eq!(
            canonical_record_id("7f9c2ba4-e88f-4e5b-9a43-0c9d1b0b2f11"),
            "7f9c2ba4-e88f-4e5b-9a43-0c9d1b0b2f11"
        );
        assert_eq!(canonical_record_id("42"), "42");
    }

    #[test]
    fn test_short_and_long_forms_meet() {
        let normalizer = RecordNormalizer::new(EntityType::Organization);
        let source = normalizer
            .normalize(&raw(json!({"Id": "001A0000006Vm9rIAC", "Name": "Acme"})))
            .unwrap();
        let local = normalizer
            .normalize(&raw(json!({"id": "001A0000006Vm9r", "name": "Acme"})))
            .unwrap();
        assert_eq!(source, local);
    }

    #[test]
    fn test_missing_primary_key() {
        let normalizer = RecordNormalizer::new(EntityType::Teacher);
        let err = normalizer.normalize(&raw(json!({"First_Name__c": "Grace"}))).unwrap_err();
        assert_eq!(
            err,
            NormalizeError::MissingPrimaryKey {
                entity_type: EntityType::Teacher
            }
        );

        let err = normalizer.normalize(&raw(json!({"Id": "  "}))).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingPrimaryKey { .. }));
    }

    #[test]
    fn test_invalid_field_names_record() {
        let normalizer = RecordNormalizer::new(EntityType::Student);
        let err = normalizer
            .normalize(&raw(json!({"Id": "s-1", "Grade__c": "ninth"})))
            .unwrap_err();
        match err {
            NormalizeError::InvalidField { record_id, .. } => assert_eq!(record_id, "s-1"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unordered_stream_is_sorted_and_bad_records_tallied() {
        let records = vec![
            raw(json!({"Id": "c", "Name": "C"})),
            raw(json!({"Name": "no id"})),
            raw(json!({"Id": "a", "Name": "A"})),
            raw(json!({"Id": "b", "Name": "B"})),
        ];
        let skipped = SkipCounter::default();
        let stream = normalized_stream(
            RecordNormalizer::new(EntityType::Organization),
            Side::Source,
            crate::source::stream_of(records),
            false,
            skipped.clone(),
        );

        let ids: Vec<String> = stream.map_ok(|r| r.id).try_collect().await.unwrap();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(skipped.get(), 1);
    }

    #[tokio::test]
    async fn test_untrimmed_ids_sort_by_canonical_id() {
        // a provider ordering by the raw key puts " b" before "a"
        let records = || vec![raw(json!({"Id": " b", "Name": "B"})), raw(json!({"Id": "a", "Name": "A"}))];
        let normalizer = RecordNormalizer::new(EntityType::Organization);

        let as_delivered = normalized_stream(
            normalizer,
            Side::Local,
            crate::source::stream_of(records()),
            true,
            SkipCounter::default(),
        );
        let ids: Vec<String> = as_delivered.map_ok(|r| r.id).try_collect().await.unwrap();
        assert_eq!(ids, vec!["b", "a"]);

        let sorted = normalized_stream(
            normalizer,
            Side::Local,
            crate::source::stream_of(records()),
            false,
            SkipCounter::default(),
        );
        let ids: Vec<String> = sorted.map_ok(|r| r.id).try_collect().await.unwrap();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_skip_counter_reset() {
        let skipped = SkipCounter::default();
        skipped.increment();
        skipped.clone().increment();
        assert_eq!(skipped.get(), 2);
        skipped.reset();
        assert_eq!(skipped.get(), 0);
    }
}
