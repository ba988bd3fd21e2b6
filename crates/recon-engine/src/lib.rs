//! Recon Engine Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Data validation and reconciliation between a local PostgreSQL mirror and the
//! upstream CRM that is the system of record.
//!
//! # Overview
//!
//! A reconciliation run compares one or more entity types (volunteers, events,
//! organizations, students, teachers) using complementary checks:
//!
//! - **schema**: declared CRM schema vs fields observed in a source sample
//! - **count**: row-count variance between source and local
//! - **completeness**: null rate of required fields
//! - **hash**: streaming sorted-merge diff of canonical record hashes (slow mode)
//! - **tolerance**: field-level comparison with numeric/date tolerances (slow mode)
//!
//! Every check produces a [`models::ValidationResult`]; a failing or erroring check
//! never aborts its siblings. Results are aggregated into a [`models::ValidationRun`]
//! whose status is always derived from them.
//!
//! # Example
//!
//! ```no_run
//! use recon_engine::config::{ConfigHandle, ReconConfig};
//! use recon_engine::orchestrator::{DataSources, OrchestratorSettings, ReconciliationOrchestrator, RunRequest};
//! use recon_engine::source::memory::MemorySource;
//! use recon_engine::store::memory::MemoryRunStore;
//! use recon_common::{EntityType, ValidationMode};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let orchestrator = ReconciliationOrchestrator::new(
//!     Arc::new(MemoryRunStore::new()),
//!     ConfigHandle::new(ReconConfig::default()),
//!     OrchestratorSettings::default(),
//! );
//! let sources = DataSources::new(
//!     Arc::new(MemorySource::new("crm")),
//!     Arc::new(MemorySource::new("local")),
//! );
//! let request = RunRequest::new(vec![EntityType::Volunteer], ValidationMode::Slow, "nightly");
//! let outcome = orchestrator.run(request, sources, CancellationToken::new()).await?;
//! println!("{}", outcome.run.status());
//! # Ok(())
//! # }
//! ```

pub mod alert;
pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod retry;
pub mod source;
pub mod store;
pub mod trend;
pub mod validators;

// Re-export commonly used types
pub use error::{EngineError, EngineResult};
pub use models::{Discrepancy, ResultStatus, RunStatus, RunSummary, ValidationResult, ValidationRun};
pub use orchestrator::{DataSources, ReconciliationOrchestrator, RunOutcome, RunRequest};
