//! Upstream CRM over a JSON HTTP API
//!
//! The CRM is reached through a thin export endpoint per object:
//!
//! - `GET {base}/{object}?since=<rfc3339>` returns `{"records": [...], "next_page": "..."}`
//! - `GET {base}/{object}/count?since=<rfc3339>` returns `{"count": n}`
//! - `GET {base}/{object}?limit=<n>` returns the first `n` records
//!
//! `next_page`, when present, is followed until exhausted. The endpoint makes no
//! ordering promise, so records are sorted after normalization.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use recon_common::EntityType;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{DataSource, RawRecord, RecordStream};
use crate::entity::descriptor;
use crate::error::SourceError;

/// Default timeout for a single CRM request in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct RecordPage {
    records: Vec<RawRecord>,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Clone)]
pub struct HttpCrmSource {
    client: Client,
    base_url: Url,
    ordered: bool,
}

impl HttpCrmSource {
    pub fn new(base_url: &str) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Result<Self, SourceError> {
        // a trailing slash makes `join` append instead of replacing the last segment
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| SourceError::Malformed(format!("invalid CRM base URL '{base_url}': {e}")))?;
        Ok(Self {
            client,
            base_url,
            ordered: false,
        })
    }

    /// Declare that the endpoint returns records ordered by id
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    fn object_url(&self, entity: EntityType, suffix: &str) -> Result<Url, SourceError> {
        let path = format!("{}{suffix}", descriptor(entity).crm_object);
        self.base_url
            .join(&path)
            .map_err(|e| SourceError::Malformed(format!("invalid CRM path '{path}': {e}")))
    }

    fn since_param(since: Option<DateTime<Utc>>) -> Vec<(&'static str, String)> {
        since
            .map(|t| vec![("since", t.to_rfc3339_opts(SecondsFormat::Secs, true))])
            .unwrap_or_default()
    }
}

async fn get_json<T: DeserializeOwned>(client: &Client, url: Url, query: &[(&str, String)]) -> Result<T, SourceError> {
    let response = client.get(url.clone()).query(query).send().await?;
    let status = response.status();

    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SourceError::Unavailable(format!("{url} returned {status}")));
    }
    if !status.is_success() {
        return Err(SourceError::Rejected {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }

    Ok(response.json().await?)
}

#[async_trait]
impl DataSource for HttpCrmSource {
    fn name(&self) -> &str {
        "crm"
    }

    async fn count(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<u64, SourceError> {
        let url = self.object_url(entity, "/count")?;
        let response: CountResponse = get_json(&self.client, url, &Self::since_param(since)).await?;
        Ok(response.count)
    }

    async fn pull(&self, entity: EntityType, since: Option<DateTime<Utc>>) -> Result<RecordStream, SourceError> {
        let client = self.client.clone();
        let base = self.base_url.clone();
        let first = self.object_url(entity, "")?;
        let query = Self::since_param(since);

        // the first page is fetched eagerly so that an unreachable CRM fails the open
        let page: RecordPage = get_json(&client, first, &query).await?;

        let pages = stream::try_unfold(Some(page), move |page| {
            let client = client.clone();
            let base = base.clone();
            async move {
                let Some(page) = page else {
                    return Ok::<_, SourceError>(None);
                };
                debug!(entity_type = %entity, records = page.records.len(), "Fetched CRM page");
                let next = match page.next_page {
                    Some(next) => {
                        let url = base
                            .join(&next)
                            .map_err(|e| SourceError::Malformed(format!("invalid next_page '{next}': {e}")))?;
                        Some(get_json::<RecordPage>(&client, url, &[]).await?)
                    },
                    None => None,
                };
                Ok(Some((page.records, next)))
            }
        });

        Ok(pages
            .map_ok(|records| stream::iter(records.into_iter().map(Ok)))
            .try_flatten()
            .boxed())
    }

    async fn sample(&self, entity: EntityType, limit: usize) -> Result<Vec<RawRecord>, SourceError> {
        let url = self.object_url(entity, "")?;
        let page: RecordPage = get_json(&self.client, url, &[("limit", limit.to_string())]).await?;
        Ok(page.records.into_iter().take(limit).collect())
    }

    fn guarantees_order(&self) -> bool {
        self.ordered
    }
}
