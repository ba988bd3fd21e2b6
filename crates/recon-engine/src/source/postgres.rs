//! Local mirror reads
//!
//! Every read of one run goes through the same exported snapshot: a REPEATABLE
//! READ transaction is held open by [`LocalSnapshot`] and each query runs in a
//! short transaction that imports it with `SET TRANSACTION SNAPSHOT`. Count, hash
//! and tolerance checks therefore see the same local state while other writers
//! keep mutating the tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use recon_common::EntityType;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::query::{LocalQueryBuilder, ReconQuery};
use super::{DataSource, RawRecord, RecordStream};
use crate::error::SourceError;

/// An exported snapshot, valid while its exporting transaction stays open
#[derive(Debug)]
pub struct LocalSnapshot {
    id: String,
    exporter: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl LocalSnapshot {
    pub async fn open(pool: &PgPool) -> Result<Self, SourceError> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        let id: String = sqlx::query_scalar("SELECT pg_export_snapshot()")
            .fetch_one(&mut *tx)
            .await?;

        if !is_snapshot_id(&id) {
            return Err(SourceError::Malformed(format!("unexpected snapshot id '{id}'")));
        }

        info!(snapshot_id = %id, "Exported local snapshot");
        Ok(Self {
            id,
            exporter: Mutex::new(Some(tx)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// End the exporting transaction; later imports of this snapshot fail
    pub async fn close(&self) -> Result<(), SourceError> {
        if let Some(tx) = self.exporter.lock().await.take() {
            tx.rollback().await?;
            debug!(snapshot_id = %self.id, "Released local snapshot");
        }
        Ok(())
    }
}

/// Snapshot ids are hex groups separated by dashes, e.g. `00000003-0000001B-1`
///
/// The id is interpolated into `SET TRANSACTION SNAPSHOT`, which takes no bind
/// parameters, so anything else is refused.
fn is_snapshot_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_hexdigit() || b == b'-')
}

/// The local mirror as a [`DataSource`]
#[derive(Debug, Clone)]
pub struct PgLocalSource {
    pool: PgPool,
    page_size: i64,
    snapshot: Option<Arc<LocalSnapshot>>,
}

impl PgLocalSource {
    pub fn new(pool: PgPool, page_size: i64) -> Self {
        Self {
            pool,
            page_size: page_size.max(1),
            snapshot: None,
        }
    }

    /// Read every query through the given snapshot
    pub fn with_snapshot(mut self, snapshot: Arc<LocalSnapshot>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    fn snapshot_id(&self) -> Option<String> {
        self.snapshot.as_ref().map(|s| s.id().to_string())
    }
}

async fn begin_read(pool: &PgPool, snapshot: Option<&str>) -> Result<Transaction<'static, Postgres>, SourceError> {
    let mut tx = pool.begin().await?;
    if let Some(id) = snapshot {
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("SET TRANSACTION SNAPSHOT '{id}'"))
            .execute(&mut *tx)
            .await?;
    }
    Ok(tx)
}

async fn fetch_records(pool: &PgPool, snapshot: Option<&str>, query: &ReconQuery) -> Result<Vec<RawRecord>, SourceError> {
    let mut tx = begin_read(pool, snapshot).await?;
    let rows: Vec<(Value,)> = query.bind_to(sqlx::query_as(&query.sql)).fetch_all(&mut *tx).await?;
    tx.rollback().await?;

    rows.into_iter()
        .map(|(value,)| match value {
            Value::Object(map) => Ok(map),
            other => Err(SourceError::Malformed(format!("expected a JSON object row, got {other}"))),
        })
        .collect()
}

struct PageCursor {
    after: Option<String>,
    exhausted: bool,
}

#[async_trait]
impl DataSource for PgLocalSource {
    fn name(&self) -> &str {
        "local"
    }

    async fn count(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<u64, SourceError> {
        let query = LocalQueryBuilder::new(entity).count(since);
        let snapshot = self.snapshot_id();
        let mut tx = begin_read(&self.pool, snapshot.as_deref()).await?;
        let (count,): (i64,) = query.bind_to(sqlx::query_as(&query.sql)).fetch_one(&mut *tx).await?;
        tx.rollback().await?;
        u64::try_from(count).map_err(|_| SourceError::Malformed(format!("negative count {count}")))
    }

    async fn pull(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<RecordStream, SourceError> {
        let builder = LocalQueryBuilder::new(entity);
        let pool = self.pool.clone();
        let snapshot = self.snapshot_id();
        let page_size = self.page_size;

        let cursor = PageCursor {
            after: None,
            exhausted: false,
        };

        let pages = stream::try_unfold(cursor, move |cursor| {
            let pool = pool.clone();
            let snapshot = snapshot.clone();
            async move {
                if cursor.exhausted {
                    return Ok::<_, SourceError>(None);
                }
                let query = builder.page(since, cursor.after.as_deref(), page_size);
                let page = fetch_records(&pool, snapshot.as_deref(), &query).await?;

                // keyset on the stored id, not the canonical one
                let after = page.last().and_then(|r| r.get("id")).and_then(Value::as_str).map(str::to_string);
                if after.is_none() && !page.is_empty() {
                    warn!(entity_type = %entity, "Page ended with a record without a textual id, stopping");
                }
                let exhausted = (page.len() as i64) < page_size || after.is_none();
                debug!(entity_type = %entity, records = page.len(), "Fetched local page");

                Ok(Some((page, PageCursor { after, exhausted })))
            }
        });

        Ok(pages
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn sample(&self, entity: EntityType, limit: usize) -> Result<Vec<RawRecord>, SourceError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let query = LocalQueryBuilder::new(entity).sample(limit);
        fetch_records(&self.pool, self.snapshot_id().as_deref(), &query).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_shape() {
        assert!(is_snapshot_id("00000003-0000001B-1"));
        assert!(!is_snapshot_id(""));
        assert!(!is_snapshot_id("1'; DROP TABLE volunteers; --"));
    }
}
