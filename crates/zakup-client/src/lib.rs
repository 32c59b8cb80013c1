//! Rate-limited goszakup API client: token bucket, backoff, retry taxonomy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use zakup_core::EntityKind;

pub const CRATE_NAME: &str = "zakup-client";

/// Shared token bucket enforcing the upstream requests-per-second limit.
///
/// One bucket per upstream endpoint, cloned via `Arc` into every caller, so
/// the whole worker pool shares a single budget. Refill is fractional: a
/// 5/s limit paces callers ~200ms apart instead of bursting once a second.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn per_second(rate: u32) -> Self {
        let rate = rate.max(1) as f64;
        Self {
            rate_per_sec: rate,
            capacity: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let refill = now.duration_since(state.last_refill).as_secs_f64() * self.rate_per_sec;
            state.tokens = (state.tokens + refill).min(self.capacity);
            state.last_refill = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                return;
            }

            let wait = Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_sec);
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Exponential delay plus uniform jitter of up to half the base delay.
    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let delay = self.delay_for_attempt(attempt_index);
        let jitter_cap = (delay / 2).max(Duration::from_millis(1));
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..jitter_cap);
        (delay + jitter).min(self.max_delay)
    }
}

/// Upstream failure taxonomy. `is_retryable` separates "try again later"
/// from "bad request shape" so callers never retry fatal errors.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    #[error("upstream throttled (retry-after {retry_after_secs}s)")]
    Throttled { retry_after_secs: u64 },
    #[error("authentication rejected by upstream")]
    Auth,
    #[error("malformed listing payload: {0}")]
    Decode(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout | FetchError::Throttled { .. } => true,
            FetchError::HttpStatus { status, .. } => *status >= 500,
            FetchError::Auth | FetchError::Decode(_) => false,
        }
    }
}

/// Query for one listing page. Timestamp-cursored entities carry a window;
/// page-cursored entities carry only `page`/`limit`.
#[derive(Debug, Clone, PartialEq)]
pub struct PageQuery {
    pub page: u64,
    pub limit: u32,
    pub updated_from: Option<DateTime<Utc>>,
    pub updated_to: Option<DateTime<Utc>>,
}

impl PageQuery {
    fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("page", self.page.to_string()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(from) = self.updated_from {
            pairs.push((
                "updated_date_gte",
                from.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        if let Some(to) = self.updated_to {
            pairs.push((
                "updated_date_lt",
                to.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }
        pairs
    }
}

/// One decoded listing page; payloads stay opaque until the transform layer.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamPage {
    pub items: Vec<serde_json::Value>,
    pub total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    total: Option<u64>,
}

/// Seam between the sync engine and the upstream listing API. The HTTP
/// client implements it for production; tests script it.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn fetch(
        &self,
        entity: EntityKind,
        query: &PageQuery,
    ) -> Result<UpstreamPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub base_url: String,
    pub bearer_token: String,
    pub rate_per_sec: u32,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://ows.goszakup.gov.kz/v2".to_string(),
            bearer_token: String::new(),
            rate_per_sec: 5,
            timeout: Duration::from_secs(30),
            user_agent: "zakup-mirror/0.1".to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP client over the upstream listing endpoints. Stateless across calls
/// apart from the shared limiter's clock.
#[derive(Debug)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
    bucket: Arc<TokenBucket>,
    backoff: BackoffPolicy,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> anyhow::Result<Self> {
        let bucket = Arc::new(TokenBucket::per_second(config.rate_per_sec));
        Self::with_bucket(config, bucket)
    }

    /// Build against an externally shared limiter (several clients against
    /// the same upstream host must share one bucket).
    pub fn with_bucket(
        config: UpstreamClientConfig,
        bucket: Arc<TokenBucket>,
    ) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", config.bearer_token))
            .context("bearer token is not a valid header value")?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            bucket,
            backoff: config.backoff,
        })
    }

    fn endpoint_url(&self, entity: EntityKind) -> String {
        format!("{}/{}", self.base_url, entity.wire_name())
    }

    async fn fetch_once(
        &self,
        url: &str,
        query: &PageQuery,
    ) -> Result<UpstreamPage, FetchError> {
        let resp = self
            .client
            .get(url)
            .query(&query.query_pairs())
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        match status {
            StatusCode::OK => {
                let envelope: ListEnvelope = resp
                    .json()
                    .await
                    .map_err(|err| FetchError::Decode(err.to_string()))?;
                Ok(UpstreamPage {
                    items: envelope.items,
                    total: envelope.total,
                })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Auth),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30);
                Err(FetchError::Throttled { retry_after_secs })
            }
            _ => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            }),
        }
    }
}

fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err)
    }
}

#[async_trait]
impl UpstreamSource for UpstreamClient {
    async fn fetch(
        &self,
        entity: EntityKind,
        query: &PageQuery,
    ) -> Result<UpstreamPage, FetchError> {
        let url = self.endpoint_url(entity);
        let span = info_span!("upstream_fetch", %entity, page = query.page, limit = query.limit);

        async {
            let mut last_err: Option<FetchError> = None;

            for attempt in 0..=self.backoff.max_retries {
                self.bucket.take().await;

                match self.fetch_once(&url, query).await {
                    Ok(page) => {
                        debug!(items = page.items.len(), total = ?page.total, "page fetched");
                        return Ok(page);
                    }
                    Err(err) if err.is_retryable() && attempt < self.backoff.max_retries => {
                        // 429 honors the upstream's Retry-After over our own curve.
                        let delay = match &err {
                            FetchError::Throttled { retry_after_secs } => {
                                Duration::from_secs(*retry_after_secs).min(self.backoff.max_delay)
                            }
                            _ => self.backoff.jittered_delay(attempt),
                        };
                        warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "retrying fetch");
                        last_err = Some(err);
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => return Err(err),
                }
            }

            Err(last_err.unwrap_or(FetchError::Timeout))
        }
        .instrument(span)
        .await
    }
}
