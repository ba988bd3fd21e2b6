//! In-memory data source
//!
//! Backs tests and file-based dry runs. Records are held per entity type and,
//! unless the source is marked unordered, kept sorted by canonical id so that
//! `pull` honours the ordering contract. Failures can be injected per entity
//! type to exercise retry, timeout and isolation behaviour.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_common::EntityType;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{stream_of, DataSource, RawRecord, RecordStream};
use crate::error::SourceError;
use crate::normalize::RecordNormalizer;

/// Injected behaviour for one entity type
#[derive(Debug, Clone)]
pub enum Failure {
    /// Every call fails with a transient error
    Unavailable,
    /// Every call blocks until the caller's timeout fires
    Hang,
    /// The next `n` calls fail transiently, then calls succeed
    FailTimes(Arc<AtomicU32>),
    /// Every call fails with a permanent error
    Malformed,
}

impl Failure {
    pub fn times(n: u32) -> Self {
        Failure::FailTimes(Arc::new(AtomicU32::new(n)))
    }
}

#[derive(Debug)]
pub struct MemorySource {
    name: String,
    records: HashMap<EntityType, Vec<RawRecord>>,
    failures: HashMap<EntityType, Failure>,
    ordered: bool,
    calls: AtomicU32,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: HashMap::new(),
            failures: HashMap::new(),
            ordered: true,
            calls: AtomicU32::new(0),
        }
    }

    /// Keep records in insertion order and report that order is not guaranteed
    pub fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }

    pub fn with_records(mut self, entity: EntityType, records: Vec<RawRecord>) -> Self {
        let entry = self.records.entry(entity).or_default();
        entry.extend(records);
        if self.ordered {
            let normalizer = RecordNormalizer::new(entity);
            entry.sort_by_cached_key(|r| normalizer.key(r));
        }
        self
    }

    /// Add records given as JSON values; non-objects are dropped with a warning
    pub fn with_values(self, entity: EntityType, values: Vec<Value>) -> Self {
        let name = self.name.clone();
        let records = values
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                other => {
                    warn!(source = %name, entity_type = %entity, value = %other, "Dropping non-object fixture record");
                    None
                },
            })
            .collect();
        self.with_records(entity, records)
    }

    pub fn fail_with(mut self, entity: EntityType, failure: Failure) -> Self {
        self.failures.insert(entity, failure);
        self
    }

    /// Load `<entity>.json` files (arrays of objects) from a directory
    ///
    /// Entity types without a file have no records.
    pub fn from_dir(name: impl Into<String>, dir: &Path) -> Result<Self, SourceError> {
        let mut source = Self::new(name);
        if !dir.is_dir() {
            return Err(SourceError::Unavailable(format!("{} is not a directory", dir.display())));
        }

        for entity in EntityType::ALL {
            let path = dir.join(format!("{entity}.json"));
            if !path.exists() {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .map_err(|e| SourceError::Unavailable(format!("{}: {e}", path.display())))?;
            let values: Vec<Value> = serde_json::from_str(&content)
                .map_err(|e| SourceError::Malformed(format!("{}: {e}", path.display())))?;
            debug!(source = %source.name, entity_type = %entity, records = values.len(), "Loaded fixture file");
            source = source.with_values(entity, values);
        }

        Ok(source)
    }

    /// Number of calls made against this source
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn check(&self, entity: EntityType) -> Result<(), SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.failures.get(&entity) {
            None => Ok(()),
            Some(Failure::Unavailable) => Err(SourceError::Unavailable(format!("{} is unavailable", self.name))),
            Some(Failure::Malformed) => Err(SourceError::Malformed(format!("{} returned garbage", self.name))),
            Some(Failure::Hang) => {
                std::future::pending::<()>().await;
                Ok(())
            },
            Some(Failure::FailTimes(remaining)) => {
                let left = remaining.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
                match left {
                    Ok(_) => Err(SourceError::Unavailable(format!("{} is temporarily unavailable", self.name))),
                    Err(_) => Ok(()),
                }
            },
        }
    }

    fn select(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Vec<RawRecord> {
        let records = self.records.get(&entity).map(Vec::as_slice).unwrap_or_default();
        match since {
            None => records.to_vec(),
            Some(since) => {
                let normalizer = RecordNormalizer::new(entity);
                records
                    .iter()
                    .filter(|r| normalizer.updated_at(r).is_some_and(|t| t >= since))
                    .cloned()
                    .collect()
            },
        }
    }
}

#[async_trait]
impl DataSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn count(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<u64, SourceError> {
        self.check(entity).await?;
        Ok(self.select(entity, since).len() as u64)
    }

    async fn pull(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<RecordStream, SourceError> {
        self.check(entity).await?;
        Ok(stream_of(self.select(entity, since)))
    }

    async fn sample(&self, entity: EntityType, limit: usize) -> Result<Vec<RawRecord>, SourceError> {
        self.check(entity).await?;
        Ok(self.select(entity, None).into_iter().take(limit).collect())
    }

    fn guarantees_order(&self) -> bool {
        self.ordered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    fn ids(records: Vec<RawRecord>) -> Vec<String> {
        records.iter().map(|r| r["Id"].as_str().unwrap().to_string()).collect()
    }

    #[tokio::test]
    async fn test_records_are_sorted_by_canonical_id() {
        let source = MemorySource::new("crm").with_values(
            EntityType::Organization,
            vec![json!({"Id": "c"}), json!({"Id": "a"}), json!({"Id": "b"})],
        );
        let records: Vec<_> = source.pull(EntityType::Organization, None).await.unwrap().try_collect().await.unwrap();
        assert_eq!(ids(records), vec!["a", "b", "c"]);
        assert!(source.guarantees_order());
    }

    #[tokio::test]
    async fn test_unordered_source_keeps_insertion_order() {
        let source = MemorySource::new("crm")
            .unordered()
            .with_values(EntityType::Organization, vec![json!({"Id": "c"}), json!({"Id": "a"})]);
        let records: Vec<_> = source.pull(EntityType::Organization, None).await.unwrap().try_collect().await.unwrap();
        assert_eq!(ids(records), vec!["c", "a"]);
        assert!(!source.guarantees_order());
    }

    #[tokio::test]
    async fn test_since_filters_by_last_modified() {
        let source = MemorySource::new("crm").with_values(
            EntityType::Event,
            vec![
                json!({"Id": "e1", "LastModifiedDate": "2024-01-01T00:00:00Z"}),
                json!({"Id": "e2", "LastModifiedDate": "2024-03-01T00:00:00Z"}),
                json!({"Id": "e3"}),
            ],
        );
        let since = "2024-02-01T00:00:00Z".parse().unwrap();
        assert_eq!(source.count(EntityType::Event, Some(since)).await.unwrap(), 1);
        assert_eq!(source.count(EntityType::Event, None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fail_times_recovers() {
        let source = MemorySource::new("crm").fail_with(EntityType::Volunteer, Failure::times(2));
        assert!(source.count(EntityType::Volunteer, None).await.is_err());
        assert!(source.count(EntityType::Volunteer, None).await.is_err());
        assert_eq!(source.count(EntityType::Volunteer, None).await.unwrap(), 0);
        assert_eq!(source.calls(), 3);
    }

    #[test]
    fn test_from_dir_loads_entity_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("volunteer.json"),
            r#"[{"Id": "v2", "FirstName": "B"}, {"Id": "v1", "FirstName": "A"}]"#,
        )
        .unwrap();

        let source = MemorySource::from_dir("fixtures", dir.path()).unwrap();
        assert_eq!(source.select(EntityType::Volunteer, None).len(), 2);
        assert!(source.select(EntityType::Event, None).is_empty());
    }

    #[test]
    fn test_from_dir_rejects_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("event.json"), "{not json").unwrap();
        assert!(matches!(
            MemorySource::from_dir("fixtures", dir.path()),
            Err(SourceError::Malformed(_))
        ));
    }
}
