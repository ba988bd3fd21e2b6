//! Timeout and retry decorator for data sources
//!
//! Every provider is wrapped once per run so that each call carries the same
//! deadline and the same [`RetryPolicy`]. Opening calls (`count`, `pull`,
//! `sample`) are retried; once a stream is open each item gets its own deadline
//! but is not retried, since a page cannot be replayed mid-stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use recon_common::EntityType;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{DataSource, RawRecord, RecordStream};
use crate::error::SourceError;
use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct ResilientSource {
    inner: Arc<dyn DataSource>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl std::fmt::Debug for ResilientSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientSource")
            .field("inner", &self.inner.name())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

async fn with_deadline<T, F>(timeout: Duration, future: F) -> Result<T, SourceError>
where
    F: Future<Output = Result<T, SourceError>>,
{
    tokio::time::timeout(timeout, future)
        .await
        .unwrap_or(Err(SourceError::Timeout(timeout)))
}

impl ResilientSource {
    pub fn new(inner: Arc<dyn DataSource>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self { inner, retry, timeout }
    }

    fn operation(&self, call: &str, entity: EntityType) -> String {
        format!("{}.{call}({entity})", self.inner.name())
    }
}

#[async_trait]
impl DataSource for ResilientSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn count(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<u64, SourceError> {
        let operation = self.operation("count", entity);
        self.retry
            .run(&operation, || with_deadline(self.timeout, self.inner.count(entity, since)))
            .await
    }

    async fn pull(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<RecordStream, SourceError> {
        let operation = self.operation("pull", entity);
        let records = self
            .retry
            .run(&operation, || with_deadline(self.timeout, self.inner.pull(entity, since)))
            .await?;

        let timeout = self.timeout;
        // a timed-out item ends the stream with the timeout error
        Ok(stream::unfold(Some(records), move |state| async move {
            let mut records = state?;
            match tokio::time::timeout(timeout, records.next()).await {
                Ok(Some(item)) => Some((item, Some(records))),
                Ok(None) => None,
                Err(_) => Some((Err(SourceError::Timeout(timeout)), None)),
            }
        })
        .boxed())
    }

    async fn sample(&self, entity: EntityType, limit: usize) -> Result<Vec<RawRecord>, SourceError> {
        let operation = self.operation("sample", entity);
        self.retry
            .run(&operation, || with_deadline(self.timeout, self.inner.sample(entity, limit)))
            .await
    }

    fn guarantees_order(&self) -> bool {
        self.inner.guarantees_order()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::source::memory::{Failure, MemorySource};
    use futures::TryStreamExt;
    use serde_json::json;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_call_times_out_after_every_attempt() {
        let inner = Arc::new(MemorySource::new("crm").fail_with(EntityType::Event, Failure::Hang));
        let source = ResilientSource::new(inner.clone(), policy(), Duration::from_secs(5));

        let err = source.count(EntityType::Event, None).await.unwrap_err();

        assert!(matches!(err, SourceError::Timeout(d) if d == Duration::from_secs(5)));
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let inner = Arc::new(
            MemorySource::new("crm")
                .with_values(EntityType::Volunteer, vec![json!({"Id": "a"}), json!({"Id": "b"})])
                .fail_with(EntityType::Volunteer, Failure::times(2)),
        );
        let source = ResilientSource::new(inner.clone(), policy(), Duration::from_secs(5));

        let records: Vec<_> = source
            .pull(EntityType::Volunteer, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let inner = Arc::new(MemorySource::new("crm").fail_with(EntityType::Student, Failure::Malformed));
        let source = ResilientSource::new(inner.clone(), policy(), Duration::from_secs(5));

        assert!(source.sample(EntityType::Student, 5).await.is_err());
        assert_eq!(inner.calls(), 1);
    }
}
