//! Configuration management
//!
//! Two layers:
//!
//! - [`EngineConfig`]: process-level settings (database, worker pool, timeouts,
//!   retry, endpoints) read from the environment
//! - [`ReconConfig`]: reconciliation policy (thresholds, tolerances, schema-drift
//!   severity, trend parameters) read from a TOML file with `RECON__` overrides
//!
//! A run takes one [`ConfigHandle::snapshot`] when it starts and never reads the
//! handle again, so a reload mid-run is not observed.

use config::{Config, Environment, File, FileFormat};
use recon_common::{EntityType, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::entity::descriptor;
use crate::error::{EngineError, EngineResult};
use crate::retry::{RetryPolicy, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_MS};

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default number of entity types reconciled in parallel.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default deadline for a single data-source call in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

/// Default keyset page size for local reads.
pub const DEFAULT_PAGE_SIZE: i64 = 1000;

/// Default number of source records inspected for schema drift.
pub const DEFAULT_SCHEMA_SAMPLE_SIZE: usize = 200;

/// Default count-variance threshold.
pub const DEFAULT_COUNT_THRESHOLD: f64 = 0.0;

/// Default per-field completeness threshold.
pub const DEFAULT_COMPLETENESS_THRESHOLD: f64 = 0.95;

/// Process-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub endpoints: EndpointConfig,
    /// Path of the reconciliation policy file
    pub policy_path: Option<PathBuf>,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Worker pool and per-call limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    pub call_timeout_secs: u64,
    pub page_size: i64,
    /// Keep hashes of mismatched records (capped per result) for the audit table
    pub capture_record_hashes: bool,
}

/// Upstream CRM and alert endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub crm_base_url: Option<String>,
    pub alert_webhook_url: Option<String>,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl EngineConfig {
    /// Load configuration from environment and defaults
    ///
    /// - `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS`, `DATABASE_CONNECT_TIMEOUT`
    /// - `RECON_MAX_CONCURRENCY`, `RECON_CALL_TIMEOUT`, `RECON_PAGE_SIZE`, `RECON_CAPTURE_HASHES`
    /// - `RECON_RETRY_MAX_ATTEMPTS`, `RECON_RETRY_INITIAL_BACKOFF_MS`, `RECON_RETRY_MAX_BACKOFF_MS`
    /// - `RECON_CRM_URL`, `RECON_ALERT_WEBHOOK`, `RECON_CONFIG`
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = EngineConfig {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or(DEFAULT_DATABASE_MAX_CONNECTIONS),
                connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")
                    .unwrap_or(DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS),
            },
            worker: WorkerConfig {
                max_concurrency: env_parse("RECON_MAX_CONCURRENCY").unwrap_or(DEFAULT_MAX_CONCURRENCY),
                call_timeout_secs: env_parse("RECON_CALL_TIMEOUT").unwrap_or(DEFAULT_CALL_TIMEOUT_SECS),
                page_size: env_parse("RECON_PAGE_SIZE").unwrap_or(DEFAULT_PAGE_SIZE),
                capture_record_hashes: env_parse("RECON_CAPTURE_HASHES").unwrap_or(true),
            },
            retry: RetryPolicy {
                max_attempts: env_parse("RECON_RETRY_MAX_ATTEMPTS").unwrap_or(DEFAULT_MAX_ATTEMPTS),
                initial_backoff_ms: env_parse("RECON_RETRY_INITIAL_BACKOFF_MS")
                    .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
                max_backoff_ms: env_parse("RECON_RETRY_MAX_BACKOFF_MS").unwrap_or(DEFAULT_MAX_BACKOFF_MS),
                ..RetryPolicy::default()
            },
            endpoints: EndpointConfig {
                crm_base_url: std::env::var("RECON_CRM_URL").ok().filter(|s| !s.is_empty()),
                alert_webhook_url: std::env::var("RECON_ALERT_WEBHOOK").ok().filter(|s| !s.is_empty()),
            },
            policy_path: std::env::var("RECON_CONFIG").ok().map(PathBuf::from),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.worker.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be greater than 0");
        }

        if self.worker.call_timeout_secs == 0 {
            anyhow::bail!("call_timeout must be greater than 0");
        }

        if self.worker.page_size <= 0 {
            anyhow::bail!("page_size must be greater than 0, got {}", self.worker.page_size);
        }

        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry max_attempts must be at least 1");
        }

        if (self.worker.max_concurrency as u32) > self.database.max_connections {
            tracing::warn!(
                max_concurrency = self.worker.max_concurrency,
                max_connections = self.database.max_connections,
                "Worker pool is larger than the connection pool; sub-jobs will queue for connections"
            );
        }

        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.call_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: None,
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            },
            worker: WorkerConfig {
                max_concurrency: DEFAULT_MAX_CONCURRENCY,
                call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
                page_size: DEFAULT_PAGE_SIZE,
                capture_record_hashes: true,
            },
            retry: RetryPolicy::default(),
            endpoints: EndpointConfig {
                crm_base_url: None,
                alert_webhook_url: None,
            },
            policy_path: None,
        }
    }
}

// ============================================================================
// Reconciliation Policy
// ============================================================================

/// Allowed deviation for one field
///
/// The effective tolerance is `max(absolute, relative * |source|)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ToleranceRule {
    pub absolute: Option<f64>,
    pub relative: Option<f64>,
}

impl ToleranceRule {
    pub fn absolute(value: f64) -> Self {
        Self {
            absolute: Some(value),
            relative: None,
        }
    }

    pub fn relative(value: f64) -> Self {
        Self {
            absolute: None,
            relative: Some(value),
        }
    }

    pub fn allowed(&self, source: f64) -> f64 {
        let absolute = self.absolute.unwrap_or(0.0);
        let relative = self.relative.unwrap_or(0.0) * source.abs();
        absolute.max(relative)
    }
}

/// Thresholds for one entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityPolicy {
    /// Maximum count variance before the count check fails
    pub count_threshold: f64,
    /// Completeness threshold for required fields without their own entry
    pub completeness_threshold: f64,
    /// Per-field completeness thresholds
    pub field_completeness: BTreeMap<String, f64>,
    /// Per-field tolerances; unlisted fields must match exactly
    pub tolerances: BTreeMap<String, ToleranceRule>,
}

impl Default for EntityPolicy {
    fn default() -> Self {
        Self {
            count_threshold: DEFAULT_COUNT_THRESHOLD,
            completeness_threshold: DEFAULT_COMPLETENESS_THRESHOLD,
            field_completeness: BTreeMap::new(),
            tolerances: BTreeMap::new(),
        }
    }
}

impl EntityPolicy {
    pub fn completeness_for(&self, field: &str) -> f64 {
        self.field_completeness
            .get(field)
            .copied()
            .unwrap_or(self.completeness_threshold)
    }
}

/// Schema-drift policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaPolicy {
    pub sample_size: usize,
    /// Severity of every drift finding
    pub severity: Severity,
    /// Source fields never reported as added
    pub ignored_fields: Vec<String>,
}

impl Default for SchemaPolicy {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SCHEMA_SAMPLE_SIZE,
            severity: Severity::Warning,
            ignored_fields: vec!["attributes".to_string()],
        }
    }
}

/// Trend analysis parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendSettings {
    /// Analyze trends after every run
    pub enabled: bool,
    /// Number of historical values in the moving window
    pub window: usize,
    /// Fewer historical values than this yields no finding
    pub min_history: usize,
    /// Standard deviations from the mean that count as a deviation
    pub k_sigma: f64,
    /// Relative jump from the mean flagged when the window has no spread
    pub jump_threshold: f64,
    /// Metrics analyzed after a run
    pub metrics: Vec<String>,
}

impl Default for TrendSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 10,
            min_history: 3,
            k_sigma: 3.0,
            jump_threshold: 0.5,
            metrics: vec!["variance".to_string(), "mismatch_rate".to_string()],
        }
    }
}

/// Reconciliation policy, immutable for the duration of a run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Policy for entity types without their own section
    pub defaults: EntityPolicy,
    pub entities: BTreeMap<EntityType, EntityPolicy>,
    pub schema: SchemaPolicy,
    pub trend: TrendSettings,
}

impl ReconConfig {
    /// Load from an optional TOML file layered with `RECON__` environment overrides
    ///
    /// `RECON__SCHEMA__SAMPLE_SIZE=50` overrides `schema.sample_size`.
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("RECON")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        Self::build(builder)
    }

    /// Parse a TOML document, without environment overrides
    pub fn from_toml_str(toml: &str) -> EngineResult<Self> {
        Self::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> EngineResult<Self> {
        let config: ReconConfig = builder
            .build()
            .and_then(Config::try_deserialize)
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn policy(&self, entity: EntityType) -> &EntityPolicy {
        self.entities.get(&entity).unwrap_or(&self.defaults)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: String| Err(EngineError::Config(msg));

        let mut policies: Vec<(Option<EntityType>, &EntityPolicy)> = vec![(None, &self.defaults)];
        policies.extend(self.entities.iter().map(|(e, p)| (Some(*e), p)));

        for (entity, policy) in policies {
            let scope = entity.map_or_else(|| "defaults".to_string(), |e| e.to_string());

            if !(policy.count_threshold >= 0.0) {
                return invalid(format!("{scope}: count_threshold must be non-negative"));
            }
            let thresholds = std::iter::once(("*", policy.completeness_threshold))
                .chain(policy.field_completeness.iter().map(|(f, t)| (f.as_str(), *t)));
            for (field, threshold) in thresholds {
                if !(0.0..=1.0).contains(&threshold) {
                    return invalid(format!(
                        "{scope}: completeness threshold for '{field}' must be within [0, 1], got {threshold}"
                    ));
                }
            }

            for (field, rule) in &policy.tolerances {
                if rule.absolute.is_none() && rule.relative.is_none() {
                    return invalid(format!("{scope}: tolerance for '{field}' sets neither absolute nor relative"));
                }
                if rule.absolute.is_some_and(|v| !(v >= 0.0)) || rule.relative.is_some_and(|v| !(v >= 0.0)) {
                    return invalid(format!("{scope}: tolerance for '{field}' must be non-negative"));
                }
                if let Some(entity) = entity {
                    match descriptor(entity).field_type(field) {
                        None => return invalid(format!("{scope}: tolerance for undeclared field '{field}'")),
                        Some(t) if !t.is_numeric_like() => {
                            return invalid(format!("{scope}: tolerance on {t} field '{field}' is not supported"))
                        },
                        Some(_) => {},
                    }
                }
            }
        }

        if self.schema.sample_size == 0 {
            return invalid("schema.sample_size must be greater than 0".to_string());
        }

        if self.trend.window < 2 {
            return invalid("trend.window must be at least 2".to_string());
        }

        if !(self.trend.k_sigma > 0.0) || !(self.trend.jump_threshold > 0.0) {
            return invalid("trend.k_sigma and trend.jump_threshold must be positive".to_string());
        }

        Ok(())
    }
}

/// Shared handle to the current policy
///
/// Runs call [`ConfigHandle::snapshot`] once; [`ConfigHandle::replace`] only
/// affects runs started afterwards.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<ReconConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: ReconConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<ReconConfig> {
        let guard = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Swap in a new policy after validating it
    pub fn replace(&self, config: ReconConfig) -> EngineResult<()> {
        config.validate()?;
        let mut guard = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const POLICY: &str = r#"
        [defaults]
        count_threshold = 0.02

        [entities.volunteer]
        count_threshold = 0.0
        completeness_threshold = 0.9

        [entities.volunteer.field_completeness]
        email = 0.8

        [entities.volunteer.tolerances]
        total_hours = { relative = 0.005 }
        last_volunteer_date = { absolute = 1.0 }

        [schema]
        severity = "blocking"
        sample_size = 50
    "#;

    #[test]
    fn test_policy_from_toml() {
        let config = ReconConfig::from_toml_str(POLICY).unwrap();

        let volunteer = config.policy(EntityType::Volunteer);
        assert_eq!(volunteer.count_threshold, 0.0);
        assert_eq!(volunteer.completeness_for("email"), 0.8);
        assert_eq!(volunteer.completeness_for("first_name"), 0.9);
        assert_eq!(volunteer.tolerances["total_hours"], ToleranceRule::relative(0.005));

        // falls back to defaults
        assert_eq!(config.policy(EntityType::Event).count_threshold, 0.02);
        assert_eq!(config.schema.severity, Severity::Blocking);
        assert_eq!(config.schema.sample_size, 50);
        assert_eq!(config.schema.ignored_fields, vec!["attributes"]);
    }

    #[test]
    fn test_empty_policy_uses_defaults() {
        let config = ReconConfig::from_toml_str("").unwrap();
        assert_eq!(config, ReconConfig::default());
    }

    #[test]
    fn test_policy_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recon.toml");
        std::fs::write(&path, POLICY).unwrap();

        let config = ReconConfig::load(Some(&path)).unwrap();
        assert_eq!(config.schema.sample_size, 50);
    }

    #[test]
    fn test_missing_policy_file_is_an_error() {
        let result = ReconConfig::load(Some(Path::new("/nonexistent/recon.toml")));
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[test]
    fn test_invalid_policies_are_rejected() {
        let cases = [
            "[defaults]\ncompleteness_threshold = 1.5",
            "[defaults]\ncount_threshold = -0.1",
            "[entities.volunteer.tolerances]\nemail = { absolute = 1.0 }",
            "[entities.event.tolerances]\nnot_a_field = { absolute = 1.0 }",
            "[schema]\nsample_size = 0",
            "[trend]\nwindow = 1",
        ];
        for toml in cases {
            assert!(ReconConfig::from_toml_str(toml).is_err(), "accepted: {toml}");
        }
    }

    #[test]
    fn test_tolerance_allowed() {
        let rule = ToleranceRule {
            absolute: Some(10.0),
            relative: Some(0.005),
        };
        assert_eq!(rule.allowed(5000.0), 25.0);
        assert_eq!(rule.allowed(100.0), 10.0);
        assert_eq!(ToleranceRule::relative(0.005).allowed(-5000.0), 25.0);
    }

    #[test]
    fn test_snapshot_is_isolated_from_replace() {
        let handle = ConfigHandle::new(ReconConfig::default());
        let snapshot = handle.snapshot();

        let mut updated = ReconConfig::default();
        updated.defaults.count_threshold = 0.5;
        handle.replace(updated).unwrap();

        assert_eq!(snapshot.defaults.count_threshold, DEFAULT_COUNT_THRESHOLD);
        assert_eq!(handle.snapshot().defaults.count_threshold, 0.5);
    }

    #[test]
    fn test_engine_config_validation() {
        let mut config = EngineConfig::default();
        assert!(config.validate().is_ok());

        config.worker.max_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
