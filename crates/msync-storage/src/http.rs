//! Rate-limited HTTP client with retry/backoff, shared by the spreadsheet fetchers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
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
    fn default() -> Self {
        Self {
            max_retries: 2,
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

    /// Wait before retrying after failed `attempt` (zero-based), or `None` when it is final.
    pub fn retry_delay(&self, disposition: RetryDisposition, attempt: usize) -> Option<Duration> {
        (disposition == RetryDisposition::Retryable && attempt < self.max_retries)
            .then(|| self.delay_for_attempt(attempt))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket allowing `per_minute` requests with a burst of the same size.
    pub fn per_minute(per_minute: u32) -> Option<Self> {
        if per_minute == 0 {
            return None;
        }
        Some(Self {
            capacity: per_minute,
            refill_every: Duration::from_secs(60) / per_minute,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_key_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_key_concurrency: 1,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available, then consumes it.
    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            drop(state);
            tokio::time::sleep(self.refill_every).await;
        }
    }

    pub async fn available(&self) -> u32 {
        self.state.lock().await.tokens
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String, body: String },
    #[error("http client is shut down")]
    Closed,
}

impl HttpError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

/// GET client bounded by a global limit, a per-key limit and an optional token bucket.
///
/// The key is usually a spreadsheet id so one busy spreadsheet cannot starve the rest.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_key_limit: usize,
    per_key: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_key_limit: config.per_key_concurrency.max(1),
            per_key: Mutex::new(HashMap::new()),
            token_bucket: config
                .token_bucket
                .map(|c| Arc::new(SimpleTokenBucket::new(c))),
            backoff: config.backoff,
        })
    }

    async fn key_semaphore(&self, key: &str) -> Arc<Semaphore> {
        let mut map = self.per_key.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_key_limit)))
            .clone()
    }

    /// Drops the key's semaphore once no request holds or waits on it.
    async fn release_key(&self, key: &str, semaphore: Arc<Semaphore>) {
        let mut map = self.per_key.lock().await;
        drop(semaphore);
        if map.get(key).is_some_and(|s| Arc::strong_count(s) == 1) {
            map.remove(key);
        }
    }

    /// Keys with a request in flight or queued.
    pub async fn active_keys(&self) -> usize {
        self.per_key.lock().await.len()
    }

    pub async fn get(
        &self,
        key: &str,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<HttpResponse, HttpError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| HttpError::Closed)?;
        let per_key = self.key_semaphore(key).await;
        let result = match per_key.acquire().await {
            Ok(_permit) => {
                if let Some(bucket) = &self.token_bucket {
                    bucket.take().await;
                }
                self.get_with_retries(url, bearer_token)
                    .instrument(tracing::info_span!("http_get", key, url))
                    .await
            }
            Err(_) => Err(HttpError::Closed),
        };
        self.release_key(key, per_key).await;
        result
    }

    async fn get_with_retries(
        &self,
        url: &str,
        bearer_token: Option<&str>,
    ) -> Result<HttpResponse, HttpError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let delay = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(HttpResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    let Some(delay) = self.backoff.retry_delay(classify_status(status), attempt)
                    else {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(HttpError::Status {
                            status: status.as_u16(),
                            url: final_url,
                            body,
                        });
                    };
                    debug!(status = status.as_u16(), attempt, "retrying after http status");
                    delay
                }
                Err(err) => {
                    let Some(delay) = self
                        .backoff
                        .retry_delay(classify_reqwest_error(&err), attempt)
                    else {
                        return Err(HttpError::Request(err));
                    };
                    debug!(error = %err, attempt, "retrying after request error");
                    delay
                }
            };

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
