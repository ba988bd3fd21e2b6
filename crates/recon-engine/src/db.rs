//! PostgreSQL connection pool

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult, StoreError};

/// Create the pool shared by the local source and the run store
pub async fn create_pool(config: &DatabaseConfig) -> EngineResult<PgPool> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| EngineError::Config("DATABASE_URL not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(url)
        .await
        .map_err(StoreError::from)?;

    tracing::info!(max_connections = config.max_connections, "Database connection pool created");

    Ok(pool)
}
