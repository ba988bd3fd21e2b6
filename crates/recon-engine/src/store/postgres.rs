//! PostgreSQL run store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recon_common::{CheckType, EntityType};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{parse_column, MetricPoint, ValidationRunStore};
use crate::error::StoreError;
use crate::models::{Discrepancy, RecordHash, RunHeader, RunSummary, ValidationResult, ValidationRun};

/// Rows per multi-row insert, keeping binds under the protocol limit
const INSERT_CHUNK: usize = 1000;

#[derive(Debug, FromRow)]
struct RunRow {
    id: Uuid,
    entity_types: Vec<String>,
    mode: String,
    triggered_by: String,
    status: String,
    cancelled: bool,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    fn into_header(self) -> Result<RunHeader, StoreError> {
        Ok(RunHeader {
            id: self.id,
            entity_types: self
                .entity_types
                .iter()
                .map(|e| parse_column("entity_type", e))
                .collect::<Result<_, _>>()?,
            mode: parse_column("mode", &self.mode)?,
            triggered_by: self.triggered_by,
            status: parse_column("status", &self.status)?,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            cancelled: self.cancelled,
            error_message: self.error_message,
        })
    }
}

#[derive(Debug, FromRow)]
struct ResultRow {
    id: Uuid,
    run_id: Uuid,
    entity_type: String,
    check_type: String,
    status: String,
    metrics: Json<BTreeMap<String, f64>>,
    error_message: Option<String>,
    duration_ms: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct DiscrepancyRow {
    id: Uuid,
    result_id: Uuid,
    kind: String,
    severity: String,
    record_id: Option<String>,
    field_name: Option<String>,
    expected: Option<String>,
    actual: Option<String>,
    note: Option<String>,
}

impl DiscrepancyRow {
    fn into_discrepancy(self) -> Result<Discrepancy, StoreError> {
        Ok(Discrepancy {
            id: self.id,
            result_id: self.result_id,
            kind: parse_column("kind", &self.kind)?,
            severity: parse_column("severity", &self.severity)?,
            record_id: self.record_id,
            field_name: self.field_name,
            expected: self.expected,
            actual: self.actual,
            note: self.note,
        })
    }
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    #[sqlx(flatten)]
    run: RunRow,
    results_total: i64,
    passed: i64,
    failed: i64,
    errored: i64,
    discrepancies: i64,
    blocking_discrepancies: i64,
    failing_entities: Vec<String>,
    failing_checks: Vec<String>,
    failing_statuses: Vec<String>,
}

impl SummaryRow {
    fn into_summary(self) -> Result<RunSummary, StoreError> {
        let mut failing = Vec::with_capacity(self.failing_checks.len());
        for ((entity, check), status) in self
            .failing_entities
            .iter()
            .zip(&self.failing_checks)
            .zip(&self.failing_statuses)
        {
            let entity: EntityType = parse_column("entity_type", entity)?;
            let check: CheckType = parse_column("check_type", check)?;
            failing.push((entity, check, status.clone()));
        }
        failing.sort_by_key(|(entity, check, _)| (*entity, *check));

        let header = self.run.into_header()?;
        Ok(RunSummary {
            run_id: header.id,
            status: header.status,
            mode: header.mode,
            entity_types: header.entity_types,
            triggered_by: header.triggered_by,
            started_at: header.started_at,
            completed_at: header.completed_at,
            cancelled: header.cancelled,
            results_total: self.results_total as usize,
            passed: self.passed as usize,
            failed: self.failed as usize,
            errored: self.errored as usize,
            discrepancies: self.discrepancies as usize,
            blocking_discrepancies: self.blocking_discrepancies as usize,
            failing_checks: failing
                .into_iter()
                .map(|(entity, check, status)| format!("{entity}/{check}: {status}"))
                .collect(),
            error_message: header.error_message,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Run store migrations applied");
        Ok(())
    }
}

async fn upsert_header(conn: &mut PgConnection, header: &RunHeader) -> Result<(), StoreError> {
    let entity_types: Vec<String> = header.entity_types.iter().map(|e| e.as_str().to_string()).collect();
    sqlx::query(
        r#"
        INSERT INTO validation_runs
            (id, entity_types, mode, triggered_by, status, cancelled, error_message, created_at, started_at, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            cancelled = EXCLUDED.cancelled,
            error_message = EXCLUDED.error_message,
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at
        "#,
    )
    .bind(header.id)
    .bind(entity_types)
    .bind(header.mode.as_str())
    .bind(&header.triggered_by)
    .bind(header.status.as_str())
    .bind(header.cancelled)
    .bind(&header.error_message)
    .bind(header.created_at)
    .bind(header.started_at)
    .bind(header.completed_at)
    .execute(conn)
    .await?;
    Ok(())
}

/// Metrics as stored; non-finite values have no JSON form and are dropped
fn storable_metrics(result: &ValidationResult) -> BTreeMap<String, f64> {
    result
        .metrics
        .iter()
        .filter(|(name, value)| {
            let finite = value.is_finite();
            if !finite {
                warn!(result_id = %result.id, metric = %name, "Dropping non-finite metric");
            }
            finite
        })
        .map(|(name, value)| (name.clone(), *value))
        .collect()
}

async fn insert_results(conn: &mut PgConnection, results: &[ValidationResult]) -> Result<(), StoreError> {
    for chunk in results.chunks(INSERT_CHUNK) {
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO validation_results \
             (id, run_id, entity_type, check_type, status, metrics, error_message, duration_ms, created_at) ",
        );
        builder.push_values(chunk, |mut b, result| {
            b.push_bind(result.id)
                .push_bind(result.run_id)
                .push_bind(result.entity_type.as_str())
                .push_bind(result.check_type.as_str())
                .push_bind(result.status.as_str())
                .push_bind(Json(storable_metrics(result)))
                .push_bind(result.error_message.clone())
                .push_bind(i64::try_from(result.duration_ms).unwrap_or(i64::MAX))
                .push_bind(result.created_at);
        });
        builder.push(" ON CONFLICT (id) DO NOTHING");
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn insert_discrepancies(conn: &mut PgConnection, discrepancies: &[&Discrepancy]) -> Result<(), StoreError> {
    for chunk in discrepancies.chunks(INSERT_CHUNK) {
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO discrepancies \
             (id, result_id, kind, severity, record_id, field_name, expected, actual, note) ",
        );
        builder.push_values(chunk, |mut b, d| {
            b.push_bind(d.id)
                .push_bind(d.result_id)
                .push_bind(d.kind.as_str())
                .push_bind(d.severity.as_str())
                .push_bind(d.record_id.clone())
                .push_bind(d.field_name.clone())
                .push_bind(d.expected.clone())
                .push_bind(d.actual.clone())
                .push_bind(d.note.clone());
        });
        builder.push(" ON CONFLICT (id) DO NOTHING");
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn insert_hashes(conn: &mut PgConnection, hashes: &[&RecordHash]) -> Result<(), StoreError> {
    for chunk in hashes.chunks(INSERT_CHUNK) {
        let mut builder =
            QueryBuilder::<Postgres>::new("INSERT INTO record_hashes (run_id, entity_type, record_id, side, hash, computed_at) ");
        builder.push_values(chunk, |mut b, h| {
            b.push_bind(h.run_id)
                .push_bind(h.entity_type.as_str())
                .push_bind(h.record_id.clone())
                .push_bind(h.side.as_str())
                .push_bind(h.hash.clone())
                .push_bind(h.computed_at);
        });
        builder.push(" ON CONFLICT DO NOTHING");
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

#[async_trait]
impl ValidationRunStore for PgRunStore {
    async fn create_run(&self, run: &ValidationRun) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_header(&mut conn, &run.header()).await?;
        debug!(run_id = %run.id, "Run created");
        Ok(())
    }

    async fn save_results(&self, run: &ValidationRun) -> Result<(), StoreError> {
        let discrepancies: Vec<&Discrepancy> = run.results().iter().flat_map(|r| &r.discrepancies).collect();
        let hashes: Vec<&RecordHash> = run.results().iter().flat_map(|r| &r.record_hashes).collect();

        let mut tx = self.pool.begin().await?;
        upsert_header(&mut tx, &run.header()).await?;
        insert_results(&mut tx, run.results()).await?;
        insert_discrepancies(&mut tx, &discrepancies).await?;
        insert_hashes(&mut tx, &hashes).await?;
        tx.commit().await?;

        info!(
            run_id = %run.id,
            status = %run.status(),
            results = run.results().len(),
            discrepancies = discrepancies.len(),
            record_hashes = hashes.len(),
            "Run results saved"
        );
        Ok(())
    }

    async fn finish_run(&self, run: &ValidationRun) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        upsert_header(&mut conn, &run.header()).await
    }

    async fn get_run(&self, id: Uuid) -> Result<ValidationRun, StoreError> {
        let header = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT id, entity_types, mode, triggered_by, status, cancelled, error_message,
                   created_at, started_at, completed_at
            FROM validation_runs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::RunNotFound(id))?
        .into_header()?;

        let result_rows = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT id, run_id, entity_type, check_type, status, metrics, error_message, duration_ms, created_at
            FROM validation_results
            WHERE run_id = $1
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let discrepancy_rows = sqlx::query_as::<_, DiscrepancyRow>(
            r#"
            SELECT d.id, d.result_id, d.kind, d.severity, d.record_id, d.field_name, d.expected, d.actual, d.note
            FROM discrepancies d
            JOIN validation_results v ON v.id = d.result_id
            WHERE v.run_id = $1
            ORDER BY d.result_id, d.record_id NULLS FIRST, d.field_name NULLS FIRST, d.kind
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_result: BTreeMap<Uuid, Vec<Discrepancy>> = BTreeMap::new();
        for row in discrepancy_rows {
            let d = row.into_discrepancy()?;
            by_result.entry(d.result_id).or_default().push(d);
        }

        let mut results = Vec::with_capacity(result_rows.len());
        for row in result_rows {
            results.push(ValidationResult {
                id: row.id,
                run_id: row.run_id,
                entity_type: parse_column("entity_type", &row.entity_type)?,
                check_type: parse_column("check_type", &row.check_type)?,
                status: parse_column("status", &row.status)?,
                metrics: row.metrics.0,
                error_message: row.error_message,
                duration_ms: u64::try_from(row.duration_ms).unwrap_or(0),
                created_at: row.created_at,
                discrepancies: by_result.remove(&row.id).unwrap_or_default(),
                record_hashes: Vec::new(),
            });
        }

        Ok(ValidationRun::restore(header, results))
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT r.id, r.entity_types, r.mode, r.triggered_by, r.status, r.cancelled, r.error_message,
                   r.created_at, r.started_at, r.completed_at,
                   res.total AS results_total,
                   res.passed, res.failed, res.errored,
                   COALESCE(res.failing_entities, ARRAY[]::TEXT[]) AS failing_entities,
                   COALESCE(res.failing_checks, ARRAY[]::TEXT[]) AS failing_checks,
                   COALESCE(res.failing_statuses, ARRAY[]::TEXT[]) AS failing_statuses,
                   dis.total AS discrepancies,
                   dis.blocking AS blocking_discrepancies
            FROM validation_runs r
            CROSS JOIN LATERAL (
                SELECT COUNT(*) AS total,
                       COUNT(*) FILTER (WHERE v.status = 'pass') AS passed,
                       COUNT(*) FILTER (WHERE v.status = 'fail') AS failed,
                       COUNT(*) FILTER (WHERE v.status = 'error') AS errored,
                       ARRAY_AGG(v.entity_type) FILTER (WHERE v.status <> 'pass') AS failing_entities,
                       ARRAY_AGG(v.check_type) FILTER (WHERE v.status <> 'pass') AS failing_checks,
                       ARRAY_AGG(v.status) FILTER (WHERE v.status <> 'pass') AS failing_statuses
                FROM validation_results v
                WHERE v.run_id = r.id
            ) res
            CROSS JOIN LATERAL (
                SELECT COUNT(*) AS total,
                       COUNT(*) FILTER (WHERE d.severity = 'blocking') AS blocking
                FROM discrepancies d
                JOIN validation_results v ON v.id = d.result_id
                WHERE v.run_id = r.id
            ) dis
            ORDER BY r.created_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    async fn metric_history(
        &self,
        entity: EntityType,
        check: CheckType,
        metric: &str,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, StoreError> {
        let mut rows: Vec<(Uuid, DateTime<Utc>, f64)> = sqlx::query_as(
            r#"
            SELECT v.run_id, v.created_at, (v.metrics ->> $3::TEXT)::DOUBLE PRECISION AS value
            FROM validation_results v
            JOIN validation_runs r ON r.id = v.run_id
            WHERE v.entity_type = $1
              AND v.check_type = $2
              AND v.metrics ? $3::TEXT
              AND r.status <> 'failed'
            ORDER BY v.created_at DESC
            LIMIT $4
            "#,
        )
        .bind(entity.as_str())
        .bind(check.as_str())
        .bind(metric)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        Ok(rows
            .into_iter()
            .map(|(run_id, recorded_at, value)| MetricPoint {
                run_id,
                recorded_at,
                value,
            })
            .collect())
    }
}
