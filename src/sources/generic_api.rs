//! JSON-over-HTTP source adapter for arbitrary list endpoints.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::sources::{SourceAdapter, SourceWrapper};

/// Object keys that commonly wrap the record list in API envelopes.
const ENVELOPE_KEYS: [&str; 4] = ["items", "data", "results", "records"];

/// Page/per-page query parameters for endpoints that paginate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pagination {
    /// Name of the 1-based page number parameter.
    pub page_param: String,
    /// Name of the page size parameter.
    pub per_page_param: String,
    /// Records requested per page; a shorter page ends the walk.
    pub page_size: usize,
    /// Hard cap on pages fetched per cycle.
    pub max_pages: usize,
}

impl Pagination {
    /// `page` / `per_page` pagination with the given page size and cap.
    pub fn new(page_size: usize, max_pages: usize) -> Self {
        Self {
            page_param: "page".to_string(),
            per_page_param: "per_page".to_string(),
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
        }
    }
}

/// GETs an exact URL and normalizes the response into wrapped records.
#[derive(Clone)]
pub struct GenericApiSource {
    client: Client,
    url: String,
    query: Vec<(String, String)>,
    pagination: Option<Pagination>,
}

impl GenericApiSource {
    /// Builds an adapter sending `headers` on every request.
    pub fn new(url: impl Into<String>, headers: HeaderMap, timeout: Duration) -> Result<Self> {
        let url = url.into();
        anyhow::ensure!(
            url.starts_with("http://") || url.starts_with("https://"),
            "source URL must be an http(s) URL: {url}"
        );
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build source HTTP client")?;
        Ok(Self {
            client,
            url,
            query: Vec::new(),
            pagination: None,
        })
    }

    /// Adds fixed query parameters sent with every request.
    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    /// Enables page-by-page fetching.
    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    async fn fetch_page(&self, extra: &[(String, String)]) -> Result<Value> {
        let response = self
            .client
            .get(&self.url)
            .query(&self.query)
            .query(extra)
            .send()
            .await
            .with_context(|| format!("request to {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("{} returned an error status", self.url))?;
        response
            .json::<Value>()
            .await
            .with_context(|| format!("{} returned invalid JSON", self.url))
    }

    async fn fetch_paginated(&self, pagination: &Pagination) -> Result<Vec<Value>> {
        let mut records = Vec::new();
        for page in 1..=pagination.max_pages {
            let params = [
                (pagination.per_page_param.clone(), pagination.page_size.to_string()),
                (pagination.page_param.clone(), page.to_string()),
            ];
            let body = match self.fetch_page(&params).await {
                Ok(body) => body,
                // The first page failing means the source is down; let the
                // aggregator retry. Later pages keep what was collected.
                Err(err) if page == 1 => return Err(err),
                Err(err) => {
                    warn!(source = %self.url, page, error = %format!("{err:#}"), "stopping pagination");
                    break;
                }
            };
            let items = extract_items(body);
            let count = items.len();
            debug!(source = %self.url, page, count, "fetched page");
            records.extend(items);
            if count < pagination.page_size {
                break;
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl SourceAdapter for GenericApiSource {
    fn label(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<Vec<SourceWrapper>> {
        let items = match &self.pagination {
            Some(pagination) => self.fetch_paginated(pagination).await?,
            None => extract_items(self.fetch_page(&[]).await?),
        };
        Ok(items
            .into_iter()
            .map(|item| SourceWrapper::from_item(item, &self.url))
            .collect())
    }
}

/// Headers for Supabase-style REST endpoints (`apikey` plus bearer token).
pub fn api_key_headers(api_key: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let Some(key) = api_key.map(str::trim).filter(|key| !key.is_empty()) else {
        return Ok(headers);
    };
    headers.insert(
        "apikey",
        HeaderValue::from_str(key).context("invalid source API key")?,
    );
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {key}")).context("invalid source API key")?,
    );
    Ok(headers)
}

/// Pulls the record list out of a response body: a top-level array, or the
/// first non-empty envelope array. Anything else yields no records.
pub fn extract_items(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => ENVELOPE_KEYS
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) if !items.is_empty() => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}
