//! Construction of the run store, data sources and alerting from arguments
//! and the environment

use recon_engine::alert::{AlertDispatcher, LogAlertDispatcher, WebhookAlertDispatcher};
use recon_engine::config::{DatabaseConfig, EngineConfig};
use recon_engine::db::create_pool;
use recon_engine::source::http::HttpCrmSource;
use recon_engine::source::memory::MemorySource;
use recon_engine::source::DataSource;
use recon_engine::store::memory::MemoryRunStore;
use recon_engine::store::postgres::PgRunStore;
use recon_engine::store::ValidationRunStore;
use recon_engine::DataSources;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{CliError, Result};
use crate::{RunArgs, StoreArgs, StoreKind};

/// Engine settings from the environment, with the database URL from the command line
pub fn engine_config(store: &StoreArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::load()?;
    if let Some(url) = store.database_url.as_ref().filter(|u| !u.is_empty()) {
        config.database.url = Some(url.clone());
    }
    Ok(config)
}

pub async fn connect(database: &DatabaseConfig) -> Result<PgPool> {
    if database.url.is_none() {
        return Err(CliError::config("DATABASE_URL is not set"));
    }
    Ok(create_pool(database).await?)
}

/// Run store for commands that only read history
pub async fn history_store(store: &StoreArgs) -> Result<PgRunStore> {
    let config = engine_config(store)?;
    let pool = connect(&config.database).await?;
    Ok(PgRunStore::new(pool))
}

/// Everything a run needs besides the policy
pub struct RunEnvironment {
    pub store: Arc<dyn ValidationRunStore>,
    pub sources: DataSources,
    pub alerts: Arc<dyn AlertDispatcher>,
}

impl RunEnvironment {
    pub async fn build(args: &RunArgs, config: &EngineConfig) -> Result<Self> {
        let has_database = config.database.url.is_some();
        let store_kind = args.store.unwrap_or(if has_database {
            StoreKind::Postgres
        } else {
            StoreKind::Memory
        });

        let needs_pool = store_kind == StoreKind::Postgres || args.local_dir.is_none();
        let pool = if needs_pool {
            if !has_database {
                return Err(CliError::config(
                    "DATABASE_URL is required for the local mirror and the postgres store; \
                     use --local-dir and --store memory for file fixtures",
                ));
            }
            Some(connect(&config.database).await?)
        } else {
            None
        };

        let source = crm_source(args, config)?;

        let sources = match (&args.local_dir, &pool) {
            (Some(dir), _) => {
                let local = MemorySource::from_dir("local", dir)?;
                info!(dir = %dir.display(), "Reading local records from fixture files");
                DataSources::new(source, Arc::new(local))
            },
            (None, Some(pool)) => DataSources::with_local_snapshot(source, pool.clone(), config.worker.page_size).await?,
            (None, None) => return Err(CliError::config("no local data source configured")),
        };

        let store: Arc<dyn ValidationRunStore> = match (store_kind, pool) {
            (StoreKind::Postgres, Some(pool)) => Arc::new(PgRunStore::new(pool)),
            (StoreKind::Postgres, None) => return Err(CliError::config("the postgres store needs DATABASE_URL")),
            (StoreKind::Memory, _) => {
                warn!("Using the in-memory run store; run history will not be persisted");
                Arc::new(MemoryRunStore::new())
            },
        };

        let alerts: Arc<dyn AlertDispatcher> = match &config.endpoints.alert_webhook_url {
            Some(url) => Arc::new(WebhookAlertDispatcher::new(url.clone()).map_err(anyhow::Error::from)?),
            None => Arc::new(LogAlertDispatcher),
        };

        Ok(Self { store, sources, alerts })
    }
}

fn crm_source(args: &RunArgs, config: &EngineConfig) -> Result<Arc<dyn DataSource>> {
    if let Some(dir) = &args.source_dir {
        info!(dir = %dir.display(), "Reading CRM records from fixture files");
        return Ok(Arc::new(MemorySource::from_dir("crm", dir)?));
    }

    let url = args
        .crm_url
        .as_ref()
        .or(config.endpoints.crm_base_url.as_ref())
        .ok_or_else(|| CliError::config("no CRM source: pass --crm-url, set RECON_CRM_URL or use --source-dir"))?;
    Ok(Arc::new(HttpCrmSource::new(url)?))
}
