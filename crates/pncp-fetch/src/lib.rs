//! Paginated retrieval of notices from the registry search API.
//!
//! Regions are fetched independently on a bounded pool; one region failing
//! (after its retry budget) never invalidates the others. The caller gets
//! whatever succeeded plus an explicit list of failed regions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use pncp_core::{items_from_response, RawNotice, Region, Status, PAGE_SIZE};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info_span, warn};

pub const CRATE_NAME: &str = "pncp-fetch";

pub const DEFAULT_SEARCH_URL: &str = "https://pncp.gov.br/api/search";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("region fetch exceeded its deadline")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Registry statuses worth another attempt: 408 (idle connection reaped),
/// 429 (rate limited) and the 5xx family the search API emits under load.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status.as_u16() {
        408 | 429 | 500..=599 => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_transport_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    /// Spacing that clears the registry's rate limiting without stretching
    /// a full 25-region search past its deadline.
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub search_url: String,
    pub user_agent: String,
    /// Per-request timeout; one stalled page must not block the pool.
    pub timeout: Duration,
    /// Minimum spacing between successive pages of the same region.
    pub page_delay: Duration,
    pub region_concurrency: usize,
    /// Overall bound for one region, proportional to the retry budget.
    pub region_deadline: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            user_agent: "pncp-edital-watch/0.1".to_string(),
            timeout: Duration::from_secs(30),
            page_delay: Duration::from_millis(50),
            region_concurrency: 8,
            region_deadline: Duration::from_secs(300),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Seam over the search endpoint so the pagination and fan-out logic can be
/// exercised against in-memory fakes.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn fetch_page(
        &self,
        region_code: &str,
        status: Option<Status>,
        page: u32,
    ) -> Result<Vec<RawNotice>, FetchError>;
}

/// reqwest-backed client for the registry search API.
#[derive(Debug)]
pub struct PncpClient {
    client: reqwest::Client,
    search_url: String,
    backoff: BackoffPolicy,
}

impl PncpClient {
    pub fn new(config: &FetchConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            search_url: config.search_url.trim_end_matches('/').to_string(),
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl SearchApi for PncpClient {
    async fn fetch_page(
        &self,
        region_code: &str,
        status: Option<Status>,
        page: u32,
    ) -> Result<Vec<RawNotice>, FetchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("tipos_documento", "edital".to_string()),
            ("ordenacao", "-data".to_string()),
            ("pagina", page.to_string()),
            ("tam_pagina", PAGE_SIZE.to_string()),
            ("municipios", region_code.to_string()),
        ];
        if let Some(status) = status {
            query.push(("status", status.api_value().to_string()));
        }

        let span = info_span!("search_page", region = region_code, page);
        let _guard = span.enter();

        let mut attempt = 0usize;
        loop {
            match self.client.get(&self.search_url).query(&query).send().await {
                Ok(resp) => {
                    let status_code = resp.status();
                    let final_url = resp.url().to_string();

                    if status_code.is_success() {
                        let body: serde_json::Value = resp.json().await?;
                        return Ok(items_from_response(&body));
                    }

                    if classify_status(status_code) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status_code.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) => {
                    if classify_transport_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

/// All raw records of one region, pages concatenated in ascending order.
#[derive(Debug)]
pub struct RegionFetch {
    pub region: Region,
    pub records: Vec<RawNotice>,
    pub pages: u32,
}

#[derive(Debug, Clone)]
pub struct RegionFailure {
    pub region: Region,
    pub error: String,
}

/// Partial-completion outcome of a multi-region fetch. Both lists keep the
/// caller's region order.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub fetched: Vec<RegionFetch>,
    pub failed: Vec<RegionFailure>,
}

/// Walks one region's pages starting at 1; a page shorter than the fixed
/// page size (including zero) terminates the walk.
pub async fn fetch_region(
    api: &dyn SearchApi,
    region_code: &str,
    status: Option<Status>,
    page_delay: Duration,
) -> Result<(Vec<RawNotice>, u32), FetchError> {
    let mut records = Vec::new();
    let mut page = 1u32;
    loop {
        let items = api.fetch_page(region_code, status, page).await?;
        let count = items.len();
        records.extend(items);
        if count < PAGE_SIZE {
            return Ok((records, page));
        }
        page += 1;
        if !page_delay.is_zero() {
            tokio::time::sleep(page_delay).await;
        }
    }
}

/// Fetches the given regions on a bounded pool. Network reads only; no
/// shared state is mutated.
pub async fn fetch_regions(
    api: Arc<dyn SearchApi>,
    regions: &[Region],
    status: Option<Status>,
    config: &FetchConfig,
) -> FetchOutcome {
    let semaphore = Arc::new(Semaphore::new(config.region_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (index, region) in regions.iter().cloned().enumerate() {
        let api = Arc::clone(&api);
        let semaphore = Arc::clone(&semaphore);
        let page_delay = config.page_delay;
        let deadline = config.region_deadline;
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore not closed");
            let result =
                match tokio::time::timeout(deadline, fetch_region(api.as_ref(), &region.code, status, page_delay))
                    .await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(FetchError::DeadlineExceeded),
                };
            (index, region, result)
        });
    }

    let mut fetched = Vec::new();
    let mut failed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, region, Ok((records, pages)))) => {
                fetched.push((index, RegionFetch { region, records, pages }));
            }
            Ok((index, region, Err(err))) => {
                warn!(region = %region.code, error = %err, "region fetch failed");
                failed.push((
                    index,
                    RegionFailure {
                        region,
                        error: err.to_string(),
                    },
                ));
            }
            Err(join_err) => warn!(error = %join_err, "region fetch task aborted"),
        }
    }

    fetched.sort_by_key(|(index, _)| *index);
    failed.sort_by_key(|(index, _)| *index);
    FetchOutcome {
        fetched: fetched.into_iter().map(|(_, fetch)| fetch).collect(),
        failed: failed.into_iter().map(|(_, failure)| failure).collect(),
    }
}
