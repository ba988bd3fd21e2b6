//! Run-history trend analysis
//!
//! For one (entity type, check type, metric) the latest value is compared with a
//! trailing window of earlier values. It is flagged when it lies more than
//! `k_sigma` standard deviations from the window mean, or, when the window has
//! no spread, when it moves more than `jump_threshold` relative to the mean.
//! Findings are advisory: past runs are never touched.

use chrono::{DateTime, Utc};
use recon_common::{CheckType, EntityType};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TrendSettings;
use crate::error::StoreError;
use crate::models::ValidationRun;
use crate::store::{MetricPoint, ValidationRunStore};

/// Why a latest value was flagged
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrendSignal {
    /// More than `k_sigma` standard deviations from the window mean
    Deviation { z_score: f64 },
    /// Relative change from a flat window; `None` when the window mean is zero
    Jump { relative_change: Option<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrendOutcome {
    InsufficientHistory { points: usize, required: usize },
    Stable,
    Flagged { signal: TrendSignal },
}

/// One historical value with its trailing moving average
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
    pub value: f64,
    pub moving_average: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub entity_type: EntityType,
    pub check_type: CheckType,
    pub metric: String,
    /// Oldest first; the last point is the one judged
    pub history: Vec<TrendPoint>,
    /// Mean of the window preceding the latest value
    pub window_mean: Option<f64>,
    pub window_stddev: Option<f64>,
    pub outcome: TrendOutcome,
}

impl TrendReport {
    pub fn is_flagged(&self) -> bool {
        matches!(self.outcome, TrendOutcome::Flagged { .. })
    }

    pub fn latest(&self) -> Option<&TrendPoint> {
        self.history.last()
    }
}

/// Advisory finding raised after a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendFinding {
    pub entity_type: EntityType,
    pub check_type: CheckType,
    pub metric: String,
    pub latest: f64,
    pub window_mean: f64,
    pub signal: TrendSignal,
}

impl std::fmt::Display for TrendFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {}: {} against mean {:.4}",
            self.entity_type, self.check_type, self.metric, self.latest, self.window_mean
        )?;
        match self.signal {
            TrendSignal::Deviation { z_score } => write!(f, " (z = {z_score:.2})"),
            TrendSignal::Jump {
                relative_change: Some(change),
            } => write!(f, " (jump {:.1}%)", change * 100.0),
            TrendSignal::Jump { relative_change: None } => write!(f, " (jump from zero)"),
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len().max(1) as f64
}

/// Population standard deviation
fn stddev(values: &[f64], mean: f64) -> f64 {
    let n = values.len().max(1) as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Trailing moving average with the given window
pub fn moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    (0..values.len())
        .map(|i| mean(&values[i.saturating_sub(window - 1)..=i]))
        .collect()
}

#[derive(Debug, Clone)]
pub struct TrendAnalyzer {
    settings: TrendSettings,
}

impl TrendAnalyzer {
    pub fn new(settings: TrendSettings) -> Self {
        Self { settings }
    }

    /// Judge the last point of a history given oldest first
    pub fn evaluate(&self, entity: EntityType, check: CheckType, metric: &str, points: &[MetricPoint]) -> TrendReport {
        let values: Vec<f64> = points.iter().map(|p| p.value).collect();
        let averages = moving_average(&values, self.settings.window);
        let history = points
            .iter()
            .zip(averages)
            .map(|(p, moving_average)| TrendPoint {
                run_id: p.run_id,
                recorded_at: p.recorded_at,
                value: p.value,
                moving_average,
            })
            .collect();

        let mut report = TrendReport {
            entity_type: entity,
            check_type: check,
            metric: metric.to_string(),
            history,
            window_mean: None,
            window_stddev: None,
            outcome: TrendOutcome::Stable,
        };

        let Some((latest, earlier)) = values.split_last() else {
            report.outcome = TrendOutcome::InsufficientHistory {
                points: 0,
                required: self.settings.min_history,
            };
            return report;
        };

        let window = &earlier[earlier.len().saturating_sub(self.settings.window)..];
        if window.len() < self.settings.min_history.max(1) {
            report.outcome = TrendOutcome::InsufficientHistory {
                points: window.len(),
                required: self.settings.min_history,
            };
            return report;
        }

        let m = mean(window);
        let sd = stddev(window, m);
        report.window_mean = Some(m);
        report.window_stddev = Some(sd);

        let signal = if sd > f64::EPSILON {
            let z_score = (latest - m) / sd;
            (z_score.abs() > self.settings.k_sigma).then_some(TrendSignal::Deviation { z_score })
        } else if m.abs() > f64::EPSILON {
            let change = (latest - m).abs() / m.abs();
            (change > self.settings.jump_threshold).then_some(TrendSignal::Jump {
                relative_change: Some(change),
            })
        } else {
            (latest.abs() > f64::EPSILON).then_some(TrendSignal::Jump { relative_change: None })
        };

        if let Some(signal) = signal {
            report.outcome = TrendOutcome::Flagged { signal };
        }
        report
    }

    /// Load the latest history of a metric and judge it
    pub async fn analyze(
        &self,
        store: &dyn ValidationRunStore,
        entity: EntityType,
        check: CheckType,
        metric: &str,
    ) -> Result<TrendReport, StoreError> {
        let points = store
            .metric_history(entity, check, metric, self.settings.window + 1)
            .await?;
        Ok(self.evaluate(entity, check, metric, &points))
    }

    /// Findings for every configured metric of a just-persisted run
    ///
    /// History that cannot be read is logged and skipped.
    pub async fn analyze_run(&self, store: &dyn ValidationRunStore, run: &ValidationRun) -> Vec<TrendFinding> {
        let mut findings = Vec::new();
        for result in run.results() {
            for metric in &self.settings.metrics {
                if result.metric(metric).is_none() {
                    continue;
                }
                let report = match self.analyze(store, result.entity_type, result.check_type, metric).await {
                    Ok(report) => report,
                    Err(e) => {
                        warn!(
                            run_id = %run.id,
                            entity_type = %result.entity_type,
                            check_type = %result.check_type,
                            metric = %metric,
                            error = %e,
                            "Failed to load metric history"
                        );
                        continue;
                    },
                };

                if let (TrendOutcome::Flagged { signal }, Some(latest), Some(window_mean)) =
                    (&report.outcome, report.latest(), report.window_mean)
                {
                    findings.push(TrendFinding {
                        entity_type: report.entity_type,
                        check_type: report.check_type,
                        metric: report.metric.clone(),
                        latest: latest.value,
                        window_mean,
                        signal: *signal,
                    });
                } else {
                    debug!(
                        entity_type = %result.entity_type,
                        check_type = %result.check_type,
                        metric = %metric,
                        outcome = ?report.outcome,
                        "No trend deviation"
                    );
                }
            }
        }
        findings
    }
}
