//! Reconciliation orchestration
//!
//! A run moves `Pending -> Running -> {Completed, PartialFailure, Failed}`:
//!
//! 1. the policy is snapshotted and the run header persisted
//! 2. one sub-job per entity type runs on a bounded pool; inside a sub-job the
//!    checks run in order (schema first) and each check's error becomes an
//!    `error` result without touching its siblings
//! 3. the status is derived from the results and everything is persisted in one
//!    save, retried once; if both attempts fail the run is `Failed` and its
//!    results are written to the log instead
//! 4. non-completed runs are handed to the alert dispatcher, and metrics to the
//!    trend analyzer
//!
//! Hash and tolerance merge both sides in canonical id order. Sides that claim
//! primary-key order are streamed as delivered; if a merge then finds canonical
//! ids out of order, the check re-reads both sides and sorts them in memory.
//!
//! Cancellation is cooperative: the token is checked before every sub-job and
//! between checks, and results gathered so far are kept.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use recon_common::{CheckType, EntityType, ValidationMode};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::alert::AlertDispatcher;
use crate::config::{ConfigHandle, EngineConfig, ReconConfig, DEFAULT_CALL_TIMEOUT_SECS, DEFAULT_MAX_CONCURRENCY};
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::models::{RunStatus, RunSummary, ValidationResult, ValidationRun};
use crate::normalize::{normalized_stream, NormalizedStream, RecordNormalizer, SkipCounter};
use crate::retry::RetryPolicy;
use crate::source::postgres::{LocalSnapshot, PgLocalSource};
use crate::source::resilient::ResilientSource;
use crate::source::{DataSource, Side};
use crate::store::ValidationRunStore;
use crate::trend::{TrendAnalyzer, TrendFinding};
use crate::validators::{
    CanonicalHasher, FieldCompletenessValidator, HashChangeDetector, RowCountValidator, SchemaDriftDetector,
    SchemaFindings, ToleranceChecker,
};

/// Worker pool, deadline and retry settings for runs
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    pub capture_record_hashes: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            capture_record_hashes: true,
        }
    }
}

impl From<&EngineConfig> for OrchestratorSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_concurrency: config.worker.max_concurrency,
            retry: config.retry.clone(),
            call_timeout: config.call_timeout(),
            capture_record_hashes: config.worker.capture_record_hashes,
        }
    }
}

/// What a driver asks for
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub entity_types: Vec<EntityType>,
    pub mode: ValidationMode,
    pub triggered_by: String,
    /// Scope counts and completeness to records updated at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Checks added on top of the mode, e.g. a hash diff in fast mode
    pub extra_checks: Vec<CheckType>,
}

impl RunRequest {
    pub fn new(entity_types: Vec<EntityType>, mode: ValidationMode, triggered_by: impl Into<String>) -> Self {
        Self {
            entity_types,
            mode,
            triggered_by: triggered_by.into(),
            since: None,
            extra_checks: Vec::new(),
        }
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn with_check(mut self, check: CheckType) -> Self {
        self.extra_checks.push(check);
        self
    }

    /// Checks to run for every entity type, in execution order
    pub fn checks(&self) -> Vec<CheckType> {
        let mut checks: Vec<CheckType> = self.mode.checks().iter().chain(&self.extra_checks).copied().collect();
        checks.sort();
        checks.dedup();
        checks
    }

    /// Requested entity types without duplicates, in request order
    fn entity_types(&self) -> Vec<EntityType> {
        let mut seen = Vec::with_capacity(self.entity_types.len());
        for entity in &self.entity_types {
            if !seen.contains(entity) {
                seen.push(*entity);
            }
        }
        seen
    }
}

/// The two sides of a run, constructed once per run
pub struct DataSources {
    pub source: Arc<dyn DataSource>,
    pub local: Arc<dyn DataSource>,
    snapshot: Option<Arc<LocalSnapshot>>,
}

impl DataSources {
    pub fn new(source: Arc<dyn DataSource>, local: Arc<dyn DataSource>) -> Self {
        Self {
            source,
            local,
            snapshot: None,
        }
    }

    /// Read the local mirror through a snapshot exported now and released when the run ends
    pub async fn with_local_snapshot(source: Arc<dyn DataSource>, pool: PgPool, page_size: i64) -> EngineResult<Self> {
        let snapshot = Arc::new(LocalSnapshot::open(&pool).await.map_err(EngineError::Snapshot)?);
        let local = PgLocalSource::new(pool, page_size).with_snapshot(Arc::clone(&snapshot));
        Ok(Self {
            source,
            local: Arc::new(local),
            snapshot: Some(snapshot),
        })
    }

    async fn release(&self) {
        if let Some(snapshot) = &self.snapshot {
            if let Err(e) = snapshot.close().await {
                warn!(snapshot_id = %snapshot.id(), error = %e, "Failed to release local snapshot");
            }
        }
    }
}

/// A finished run and the advisories raised after it
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: ValidationRun,
    pub advisories: Vec<TrendFinding>,
}

impl RunOutcome {
    pub fn summary(&self) -> RunSummary {
        self.run.summary()
    }
}

/// Results of one entity type
struct SubJobOutcome {
    results: Vec<ValidationResult>,
    /// Checks not started because the run was cancelled
    skipped: Vec<CheckType>,
}

/// Everything one entity-type pipeline needs, owned so it can run on the pool
struct SubJob {
    entity: EntityType,
    checks: Vec<CheckType>,
    source: Arc<dyn DataSource>,
    local: Arc<dyn DataSource>,
    config: Arc<ReconConfig>,
    since: Option<DateTime<Utc>>,
    capture_hashes: bool,
    cancel: CancellationToken,
}

impl SubJob {
    #[instrument(name = "sub_job", skip_all, fields(entity_type = %self.entity))]
    async fn run(self) -> SubJobOutcome {
        let mut results = Vec::with_capacity(self.checks.len());
        let mut findings = SchemaFindings::default();

        for (i, check) in self.checks.iter().copied().enumerate() {
            if self.cancel.is_cancelled() {
                let skipped = self.checks[i..].to_vec();
                info!(skipped = ?skipped, "Run cancelled, skipping remaining checks");
                return SubJobOutcome { results, skipped };
            }

            let started = Instant::now();
            let skipped_records = SkipCounter::default();
            let outcome = self.check(check, &mut findings, &skipped_records).await;

            let mut result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    warn!(check_type = %check, error = %e, "Check could not complete");
                    ValidationResult::error(self.entity, check, &e)
                },
            };
            result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            if reads_records(check) {
                result.set_metric("normalize_errors", skipped_records.get() as f64);
            }

            info!(
                check_type = %check,
                status = %result.status,
                discrepancies = result.discrepancies.len(),
                duration_ms = result.duration_ms,
                "Check finished"
            );
            results.push(result);
        }

        SubJobOutcome {
            results,
            skipped: Vec::new(),
        }
    }

    async fn check(
        &self,
        check: CheckType,
        findings: &mut SchemaFindings,
        skipped: &SkipCounter,
    ) -> Result<ValidationResult, ValidationError> {
        let entity = self.entity;
        let policy = self.config.policy(entity);

        match check {
            CheckType::Schema => {
                let detector = SchemaDriftDetector::new(entity, self.config.schema.clone());
                let (result, found) = detector.run(self.source.as_ref()).await?;
                *findings = found;
                Ok(result)
            },
            CheckType::Count => {
                RowCountValidator::new(policy.count_threshold)
                    .run(entity, self.source.as_ref(), self.local.as_ref(), self.since)
                    .await
            },
            CheckType::Completeness => {
                let (source, local) = self.open_streams(self.since, false, skipped).await?;
                FieldCompletenessValidator::new(entity, policy)
                    .with_absent_fields(&findings.removed)
                    .run(entity, local, Some(source))
                    .await
            },
            CheckType::Hash | CheckType::Tolerance => match self.compare(check, false, skipped).await {
                // a provider's key order can disagree with canonical id order (untrimmed or short ids)
                Err(ValidationError::OrderViolation { side, previous, current }) => {
                    warn!(
                        check_type = %check,
                        side = %side,
                        previous = %previous,
                        current = %current,
                        "Canonical ids out of primary-key order, re-reading both sides sorted"
                    );
                    skipped.reset();
                    self.compare(check, true, skipped).await
                },
                other => other,
            },
        }
    }

    /// Merge-based checks over full pulls of both sides
    async fn compare(
        &self,
        check: CheckType,
        force_sort: bool,
        skipped: &SkipCounter,
    ) -> Result<ValidationResult, ValidationError> {
        let entity = self.entity;
        // full pulls: a watermark on one side would report unchanged records as missing
        let (source, local) = self.open_streams(None, force_sort, skipped).await?;
        if check == CheckType::Hash {
            HashChangeDetector::new(CanonicalHasher::for_entity(entity))
                .capture_hashes(self.capture_hashes)
                .diff(entity, source, local)
                .await
        } else {
            ToleranceChecker::new(entity, self.config.policy(entity))
                .run(entity, source, local)
                .await
        }
    }

    async fn open_streams(
        &self,
        since: Option<DateTime<Utc>>,
        force_sort: bool,
        skipped: &SkipCounter,
    ) -> Result<(NormalizedStream, NormalizedStream), ValidationError> {
        let normalizer = RecordNormalizer::new(self.entity);
        let (source, local) = futures::try_join!(
            self.source.pull(self.entity, since),
            self.local.pull(self.entity, since)
        )?;
        let source_ordered = self.source.guarantees_order() && !force_sort;
        let local_ordered = self.local.guarantees_order() && !force_sort;
        Ok((
            normalized_stream(normalizer, Side::Source, source, source_ordered, skipped.clone()),
            normalized_stream(normalizer, Side::Local, local, local_ordered, skipped.clone()),
        ))
    }
}

fn reads_records(check: CheckType) -> bool {
    matches!(check, CheckType::Completeness | CheckType::Hash | CheckType::Tolerance)
}

pub struct ReconciliationOrchestrator {
    store: Arc<dyn ValidationRunStore>,
    config: ConfigHandle,
    settings: OrchestratorSettings,
    alerts: Option<Arc<dyn AlertDispatcher>>,
}

impl ReconciliationOrchestrator {
    pub fn new(store: Arc<dyn ValidationRunStore>, config: ConfigHandle, settings: OrchestratorSettings) -> Self {
        Self {
            store,
            config,
            settings,
            alerts: None,
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertDispatcher>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Execute one run to a terminal status
    ///
    /// Returns an error only when the run could not be started; every later
    /// failure is reflected in the returned run's status.
    #[instrument(skip_all, fields(run_id = tracing::field::Empty, mode = %request.mode, triggered_by = %request.triggered_by))]
    pub async fn run(
        &self,
        request: RunRequest,
        sources: DataSources,
        cancel: CancellationToken,
    ) -> EngineResult<RunOutcome> {
        let entity_types = request.entity_types();
        if entity_types.is_empty() {
            sources.release().await;
            return Err(EngineError::Config("a run needs at least one entity type".to_string()));
        }

        // the policy for the whole run; later replacements are not observed
        let config = self.config.snapshot();
        let checks = request.checks();

        let mut run = ValidationRun::new(entity_types.clone(), request.mode, request.triggered_by.clone());
        tracing::Span::current().record("run_id", tracing::field::display(run.id));
        if let Err(e) = run.start() {
            sources.release().await;
            return Err(e.into());
        }

        if let Err(e) = RetryPolicy::retry_once()
            .run("create_run", || self.store.create_run(&run))
            .await
        {
            sources.release().await;
            return Err(e.into());
        }

        info!(
            entity_types = ?entity_types,
            checks = ?checks,
            since = ?request.since,
            "Reconciliation run started"
        );

        let source: Arc<dyn DataSource> = Arc::new(ResilientSource::new(
            Arc::clone(&sources.source),
            self.settings.retry.clone(),
            self.settings.call_timeout,
        ));
        let local: Arc<dyn DataSource> = Arc::new(ResilientSource::new(
            Arc::clone(&sources.local),
            self.settings.retry.clone(),
            self.settings.call_timeout,
        ));

        let jobs = entity_types.iter().map(|entity| SubJob {
            entity: *entity,
            checks: checks.clone(),
            source: Arc::clone(&source),
            local: Arc::clone(&local),
            config: Arc::clone(&config),
            since: request.since,
            capture_hashes: self.settings.capture_record_hashes,
            cancel: cancel.clone(),
        });

        let outcomes: Vec<SubJobOutcome> = stream::iter(jobs)
            .map(SubJob::run)
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        sources.release().await;

        let mut cancelled = false;
        for outcome in outcomes {
            cancelled |= !outcome.skipped.is_empty();
            for result in outcome.results {
                run.record(result)?;
            }
        }

        let status = run.finish(cancelled)?;
        info!(status = %status, results = run.results().len(), cancelled, "Reconciliation run finished");

        self.persist(&mut run).await?;

        let summary = run.summary();
        if summary.status != RunStatus::Completed {
            self.alert(&summary).await;
        }

        let advisories = if config.trend.enabled && run.status() != RunStatus::Failed {
            let findings = TrendAnalyzer::new(config.trend.clone())
                .analyze_run(self.store.as_ref(), &run)
                .await;
            for finding in &findings {
                warn!(finding = %finding, "Trend deviation");
            }
            findings
        } else {
            Vec::new()
        };

        Ok(RunOutcome { run, advisories })
    }

    /// Save the finished run, retrying once; failing both turns the run `Failed`
    async fn persist(&self, run: &mut ValidationRun) -> EngineResult<()> {
        let finished: &ValidationRun = run;
        let saved = RetryPolicy::retry_once()
            .run("save_results", || self.store.save_results(finished))
            .await;

        let Err(e) = saved else {
            return Ok(());
        };

        error!(
            run_id = %run.id,
            error = %e,
            derived_status = %run.status(),
            results = run.results().len(),
            "Failed to persist run results"
        );
        for result in run.results() {
            error!(
                run_id = %run.id,
                entity_type = %result.entity_type,
                check_type = %result.check_type,
                status = %result.status,
                metrics = ?result.metrics,
                discrepancies = result.discrepancies.len(),
                classification = ?result.classification(),
                error = result.error_message.as_deref().unwrap_or_default(),
                "Unpersisted result"
            );
        }

        run.fail(format!("failed to persist results: {e}"))?;
        if let Err(e) = self.store.finish_run(run).await {
            warn!(run_id = %run.id, error = %e, "Failed to record run failure");
        }
        Ok(())
    }

    async fn alert(&self, summary: &RunSummary) {
        let Some(alerts) = &self.alerts else {
            return;
        };
        if let Err(e) = alerts.notify(summary).await {
            warn!(run_id = %summary.run_id, error = %e, "Failed to deliver run alert");
        }
    }
}
