//! In-memory run store for tests and dry runs

use async_trait::async_trait;
use recon_common::{CheckType, EntityType};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{MetricPoint, ValidationRunStore};
use crate::error::StoreError;
use crate::models::{RunStatus, RunSummary, ValidationRun};

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    /// Runs in creation order
    runs: RwLock<Vec<ValidationRun>>,
    save_attempts: AtomicU32,
    /// Number of upcoming saves to reject
    rejected_saves: AtomicU32,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` calls to `save_results`
    pub fn reject_saves(self, n: u32) -> Self {
        self.rejected_saves.store(n, Ordering::SeqCst);
        self
    }

    /// Number of `save_results` calls so far, rejected or not
    pub fn save_attempts(&self) -> u32 {
        self.save_attempts.load(Ordering::SeqCst)
    }

    async fn upsert(&self, run: &ValidationRun) {
        let mut runs = self.runs.write().await;
        match runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => runs.push(run.clone()),
        }
    }
}

#[async_trait]
impl ValidationRunStore for MemoryRunStore {
    async fn create_run(&self, run: &ValidationRun) -> Result<(), StoreError> {
        self.upsert(run).await;
        Ok(())
    }

    async fn save_results(&self, run: &ValidationRun) -> Result<(), StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        let rejected = self
            .rejected_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StoreError::Rejected(format!("run {} rejected by memory store", run.id)));
        }

        self.upsert(run).await;
        Ok(())
    }

    async fn finish_run(&self, run: &ValidationRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        let existing = runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or(StoreError::RunNotFound(run.id))?;
        // header only: keep whatever results were stored before
        *existing = ValidationRun::restore(run.header(), existing.results().to_vec());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<ValidationRun, StoreError> {
        self.runs
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunSummary>, StoreError> {
        let runs = self.runs.read().await;
        Ok(runs.iter().rev().take(limit).map(ValidationRun::summary).collect())
    }

    async fn metric_history(
        &self,
        entity: EntityType,
        check: CheckType,
        metric: &str,
        limit: usize,
    ) -> Result<Vec<MetricPoint>, StoreError> {
        let runs = self.runs.read().await;
        let mut points: Vec<MetricPoint> = runs
            .iter()
            .filter(|run| run.status() != RunStatus::Failed)
            .flat_map(|run| run.results())
            .filter(|r| r.entity_type == entity && r.check_type == check)
            .filter_map(|r| {
                r.metric(metric).map(|value| MetricPoint {
                    run_id: r.run_id,
                    recorded_at: r.created_at,
                    value,
                })
            })
            .collect();

        points.sort_by_key(|p| p.recorded_at);
        let skip = points.len().saturating_sub(limit);
        Ok(points.split_off(skip))
    }
}
