//! HTTP transport + request-rate limiting for dealsync.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealsync-transport";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 64,
        }
    }
}

/// Externally imposed request quota: at most `requests_per_window` starts per `window_duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 20,
            window_duration: Duration::from_secs(2),
        }
    }
}

/// Sliding-log limiter: a start is granted only once fewer than `requests_per_window`
/// grants fall inside the trailing `window_duration`.
///
/// Callers that acquire back-to-back therefore proceed in batches: the first grant of
/// a batch waits for the first grant of the previous batch to leave the window.
///
/// The bound holds for grant instants. A caller that does work between the grant and
/// the actual request (spawning a task, say) can shift its real start slightly later,
/// so observed request starts may drift by that scheduling delay.
#[derive(Debug)]
pub struct WindowLimiter {
    capacity: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl WindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.requests_per_window.max(1) as usize;
        Self {
            capacity,
            window: config.window_duration,
            starts: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Wait for a start slot and return the instant it was granted.
    pub async fn acquire(&self) -> Instant {
        loop {
            let mut starts = self.starts.lock().await;
            let now = Instant::now();
            while let Some(oldest) = starts.front() {
                if now.duration_since(*oldest) >= self.window {
                    starts.pop_front();
                } else {
                    break;
                }
            }

            if starts.len() < self.capacity {
                starts.push_back(now);
                return now;
            }

            let reopens_at = match starts.front() {
                Some(oldest) => *oldest + self.window,
                None => now,
            };
            drop(starts);
            tokio::time::sleep_until(reopens_at).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl HttpFetcher {
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
            global_limit: Arc::new(Semaphore::new(
                config.global_concurrency.clamp(1, Semaphore::MAX_PERMITS),
            )),
        })
    }

    /// GET `url` and return the body; any non-2xx status is an error.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_fetch", %run_id, url = %redacted_url(url));
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = redacted_url(resp.url().as_str());

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok::<_, FetchError>(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// POST `body` as JSON. Every HTTP response is returned as its status; only a
    /// transport failure is an error.
    pub async fn post_json<T>(&self, run_id: Uuid, url: &str, body: &T) -> Result<StatusCode, FetchError>
    where
        T: Serialize + ?Sized,
    {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_post", %run_id, url = %redacted_url(url));
        async {
            let resp = self.client.post(url).json(body).send().await?;
            let status = resp.status();
            debug!(status = status.as_u16(), "posted");
            Ok::<_, FetchError>(status)
        }
        .instrument(span)
        .await
    }
}

/// Parse `base` and append `pairs` as percent-encoded query parameters.
pub fn url_with_query(base: &str, pairs: &[(&str, &str)]) -> Result<String, FetchError> {
    let mut url = Url::parse(base).map_err(|err| FetchError::InvalidUrl {
        url: redacted_url(base),
        reason: err.to_string(),
    })?;
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs);
    }
    Ok(url.into())
}

/// Strip the query string (which carries the API token) before a URL reaches logs or errors.
pub fn redacted_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => url.split('?').next().unwrap_or_default().to_string(),
    }
}
