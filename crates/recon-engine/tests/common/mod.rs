//! Shared fixtures for recon-engine integration tests
//!
//! Records are built in the CRM's shape; the local mirror accepts the same
//! field names, so one fixture can seed both sides.

#![allow(dead_code)]

use anyhow::{Context, Result};
use recon_engine::config::{ConfigHandle, ReconConfig};
use recon_engine::orchestrator::{OrchestratorSettings, ReconciliationOrchestrator};
use recon_engine::retry::RetryPolicy;
use recon_engine::store::ValidationRunStore;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tracing::{debug, info};

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,recon_engine=debug,sqlx=warn,testcontainers=info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn volunteer_id(i: usize) -> String {
    format!("0035e00000VOL{i:05}")
}

pub fn event_id(i: usize) -> String {
    format!("a0B5e00000EVT{i:05}")
}

/// A fully populated CRM Contact
pub fn volunteer(i: usize) -> Value {
    json!({
        "Id": volunteer_id(i),
        "FirstName": format!("First{i}"),
        "LastName": format!("Last{i}"),
        "Email": format!("volunteer{i}@example.org"),
        "Title": "Engineer",
        "Department": "Outreach",
        "AccountId": "0015e00000ORG00001",
        "Volunteer_Hours__c": 12.5,
        "Last_Volunteer_Date__c": "2024-03-01",
        "HasOptedOutOfEmail": false,
        "LastModifiedDate": "2024-03-02T08:00:00.000+0000",
        "attributes": {"type": "Contact"}
    })
}

pub fn volunteers(n: usize) -> Vec<Value> {
    (0..n).map(volunteer).collect()
}

/// A fully populated CRM Session__c
pub fn event(i: usize) -> Value {
    json!({
        "Id": event_id(i),
        "Name": format!("Career Day {i}"),
        "Session_Type__c": "In Person",
        "Session_Status__c": "Confirmed",
        "Start_Date_and_Time__c": "2024-04-01T15:00:00.000+0000",
        "End_Date_and_Time__c": "2024-04-01T17:00:00.000+0000",
        "Location_Information__c": "Main Hall",
        "Registered_Count__c": 12,
        "Volunteers_Needed__c": 3,
        "LastModifiedDate": "2024-03-20T10:30:00.000+0000"
    })
}

pub fn events(n: usize) -> Vec<Value> {
    (0..n).map(event).collect()
}

/// Drop a field from every record
pub fn without_field(records: Vec<Value>, field: &str) -> Vec<Value> {
    records
        .into_iter()
        .map(|mut r| {
            if let Some(map) = r.as_object_mut() {
                map.remove(field);
            }
            r
        })
        .collect()
}

/// Settings with fast retries and a short deadline
pub fn test_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_concurrency: 2,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            multiplier: 2.0,
        },
        call_timeout: Duration::from_millis(200),
        capture_record_hashes: true,
    }
}

pub fn orchestrator(store: Arc<dyn ValidationRunStore>, config: ReconConfig) -> ReconciliationOrchestrator {
    ReconciliationOrchestrator::new(store, ConfigHandle::new(config), test_settings())
}

/// PostgreSQL container with the run-store migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL test container...");

        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container.get_host().await.context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        debug!("PostgreSQL connection: {}", connection_string);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
