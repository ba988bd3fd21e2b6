//! Data-source providers
//!
//! Both sides of a comparison are reached through [`DataSource`]. Providers are
//! constructed once per run and handed to the orchestrator explicitly.
//!
//! - [`postgres::PgLocalSource`]: the local mirror, read through one exported snapshot
//! - [`http::HttpCrmSource`]: the upstream CRM over a JSON HTTP API
//! - [`memory::MemorySource`]: fixtures for tests and file-based dry runs
//! - [`resilient::ResilientSource`]: timeout and retry decorator applied to both sides

pub mod http;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod resilient;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use recon_common::EntityType;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// An untyped record as delivered by a provider
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Stream of raw records for one entity type
pub type RecordStream = BoxStream<'static, Result<RawRecord, SourceError>>;

/// Which side of the comparison a value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// The upstream CRM, the system of record
    Source,
    /// The local mirror
    Local,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Source => "source",
            Side::Local => "local",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source" => Ok(Side::Source),
            "local" => Ok(Side::Local),
            other => Err(format!("unknown side '{other}'")),
        }
    }
}

/// A provider of records for every entity type
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Number of records, optionally only those updated at or after `since`
    async fn count(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<u64, SourceError>;

    /// Stream every record, optionally only those updated at or after `since`
    ///
    /// Record ids are unique within one pull. When [`DataSource::guarantees_order`]
    /// is true the stream is ordered bytewise by primary key.
    async fn pull(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<RecordStream, SourceError>;

    /// The first `limit` records, used for schema inspection
    async fn sample(&self, entity: EntityType, limit: usize) -> Result<Vec<RawRecord>, SourceError> {
        let stream = self.pull(entity, None).await?;
        stream.take(limit).collect::<Vec<_>>().await.into_iter().collect()
    }

    /// Whether `pull` yields records in primary-key order
    fn guarantees_order(&self) -> bool {
        true
    }
}

/// Stream over records already held in memory
pub(crate) fn stream_of(records: Vec<RawRecord>) -> RecordStream {
    stream::iter(records.into_iter().map(Ok)).boxed()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_side_round_trip() {
        for side in [Side::Source, Side::Local] {
            assert_eq!(side.as_str().parse::<Side>().unwrap(), side);
        }
        assert!("remote".parse::<Side>().is_err());
    }
}
