//! Shared HTTP plumbing for store adapters.
//!
//! Every request goes through a per-adapter rate limiter and a per-run request
//! budget, and transient failures are retried with exponential backoff.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::AdapterError;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; price-watcher/0.1)";
const ACCEPT_LANGUAGE: &str = "pl-PL,pl;q=0.9";

/// Caps how many requests one adapter may send within a run.
#[derive(Debug)]
pub struct RequestBudget {
    limit: u32,
    used: AtomicU32,
}

impl RequestBudget {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used: AtomicU32::new(0),
        }
    }

    pub fn try_acquire(&self) -> Result<(), AdapterError> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.limit).then_some(used + 1)
            })
            .map(|_| ())
            .map_err(|_| AdapterError::BudgetExhausted { limit: self.limit })
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::SeqCst);
    }
}

pub struct HttpFetcher {
    http: reqwest::Client,
    limiter: Arc<Limiter>,
    budget: RequestBudget,
    max_retries: u32,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

impl HttpFetcher {
    pub fn new(config: &RateLimitConfig) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            http,
            limiter: create_rate_limiter(config),
            budget: RequestBudget::new(config.max_requests_per_run),
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
            backoff_max_ms: config.backoff_max_ms,
        })
    }

    pub fn budget(&self) -> &RequestBudget {
        &self.budget
    }

    /// GET a JSON document.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, AdapterError> {
        let body = self.get_text_with_query(url, query).await?;
        serde_json::from_str(&body).map_err(|e| AdapterError::Parse(format!("{url}: {e}")))
    }

    /// GET a page body as text.
    pub async fn get_text(&self, url: &str) -> Result<String, AdapterError> {
        self.get_text_with_query(url, &[]).await
    }

    async fn get_text_with_query(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<String, AdapterError> {
        self.with_retry(|| async move {
            self.budget.try_acquire()?;
            self.limiter.until_ready().await;

            debug!(url, "GET");
            let response = self
                .http
                .get(url)
                .header(reqwest::header::ACCEPT_LANGUAGE, ACCEPT_LANGUAGE)
                .query(query)
                .send()
                .await?;

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(AdapterError::RateLimited {
                    host: response.url().host_str().unwrap_or_default().to_string(),
                });
            }
            if !status.is_success() {
                return Err(AdapterError::UnexpectedStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            Ok(response.text().await?)
        })
        .await
    }

    async fn with_retry<F, Fut, T>(&self, operation: F) -> Result<T, AdapterError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retriable() || attempt >= self.max_retries => return Err(e),
                Err(e) => {
                    attempt += 1;

                    let backoff_ms = std::cmp::min(
                        self.backoff_base_ms
                            .saturating_mul(1u64 << (attempt - 1).min(32)),
                        self.backoff_max_ms,
                    );

                    warn!(
                        attempt,
                        backoff_ms,
                        error = %e,
                        "Retrying after transient failure"
                    );

                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }
    }
}

fn create_rate_limiter(config: &RateLimitConfig) -> Arc<Limiter> {
    let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(config.burst_size).unwrap_or(rps);

    let quota = Quota::per_second(rps).allow_burst(burst);
    Arc::new(RateLimiter::direct(quota))
}
