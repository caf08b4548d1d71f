//! HTTP client for downloading raw track payloads.
//!
//! Captured tracks live on a file server as GPX documents. This module
//! fetches them with:
//! - Connection pooling
//! - Request-rate limiting over a one-second sliding window
//! - Parallel fetching with bounded concurrency
//! - Retry with exponential backoff on 429, 5xx and transport errors

use log::{debug, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

use crate::{Result, TramificationError};

/// Fetcher tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Parallel requests. Default: 8
    pub max_concurrency: usize,
    /// Retries after the first attempt. Default: 3
    pub max_retries: u32,
    /// Requests started per second across all workers. Default: 20
    pub requests_per_second: u32,
    /// Per-request timeout. Default: 30
    pub timeout_secs: u64,
    /// First backoff delay, doubled on every retry. Default: 500
    pub initial_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_retries: 3,
            requests_per_second: 20,
            timeout_secs: 30,
            initial_backoff_ms: 500,
        }
    }
}

impl FetchConfig {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(1 << retry.saturating_sub(1).min(6)))
    }
}

/// Result of fetching one track payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackFetchResult {
    pub url: String,
    pub payload: Option<String>,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl TrackFetchResult {
    fn ok(url: &str, payload: String) -> Self {
        Self {
            url: url.to_string(),
            payload: Some(payload),
            success: true,
            status_code: Some(200),
            error: None,
        }
    }

    fn failed(url: &str, status_code: Option<u16>, error: String) -> Self {
        Self {
            url: url.to_string(),
            payload: None,
            success: false,
            status_code,
            error: Some(error),
        }
    }

    /// The payload, or the failure as an error.
    pub fn into_payload(self) -> Result<String> {
        match self.payload {
            Some(payload) if self.success => Ok(payload),
            _ => Err(TramificationError::Http {
                message: self.error.unwrap_or_else(|| format!("no payload for {}", self.url)),
                status_code: self.status_code,
            }),
        }
    }
}

/// Progress callback type: (completed, total)
pub type ProgressCallback = Arc<dyn Fn(u32, u32) + Send + Sync>;

/// Sliding one-second window over request start times.
struct RateLimiter {
    request_times: Mutex<VecDeque<Instant>>,
    per_second: usize,
}

impl RateLimiter {
    fn new(per_second: u32) -> Self {
        let per_second = per_second.max(1) as usize;
        Self {
            request_times: Mutex::new(VecDeque::with_capacity(per_second + 1)),
            per_second,
        }
    }

    /// Wait for a free slot in the window and claim it.
    async fn acquire(&self) {
        loop {
            let wait_time = {
                let mut times = self.request_times.lock().await;
                let now = Instant::now();
                let cutoff = now.checked_sub(Duration::from_secs(1));
                while times
                    .front()
                    .zip(cutoff)
                    .map_or(false, |(&t, cutoff)| t < cutoff)
                {
                    times.pop_front();
                }

                if times.len() < self.per_second {
                    times.push_back(now);
                    None
                } else {
                    times
                        .front()
                        .map(|&oldest| (oldest + Duration::from_secs(1)).saturating_duration_since(now))
                }
            };

            match wait_time {
                Some(duration) => {
                    debug!("[TrackFetcher] Rate limit: waiting {:?}", duration);
                    tokio::time::sleep(duration).await;
                }
                None => break,
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Concurrent downloader of track payloads.
pub struct TrackFetcher {
    client: Client,
    config: FetchConfig,
    rate_limiter: Arc<RateLimiter>,
}

impl TrackFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(config.max_concurrency)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TramificationError::Http {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        Ok(Self {
            client,
            rate_limiter: Arc::new(RateLimiter::new(config.requests_per_second)),
            config,
        })
    }

    /// Fetch every URL, returning one result per URL in input order.
    pub async fn fetch_payloads(
        &self,
        urls: Vec<String>,
        on_progress: Option<ProgressCallback>,
    ) -> Vec<TrackFetchResult> {
        let total = urls.len() as u32;
        let completed = Arc::new(AtomicU32::new(0));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        info!(
            "[TrackFetcher] Fetching {} tracks with {} concurrent workers",
            total, self.config.max_concurrency
        );
        let start = Instant::now();

        let tasks: Vec<_> = urls
            .into_iter()
            .map(|url| {
                let client = self.client.clone();
                let config = self.config.clone();
                let rate_limiter = Arc::clone(&self.rate_limiter);
                let semaphore = Arc::clone(&semaphore);
                let completed = Arc::clone(&completed);
                let callback = on_progress.clone();
                let task_url = url.clone();

                let handle = tokio::spawn(async move {
                    let url = task_url;
                    let result = match semaphore.acquire().await {
                        Ok(_permit) => Self::fetch_single(&client, &config, &rate_limiter, &url).await,
                        Err(e) => TrackFetchResult::failed(&url, None, format!("Semaphore closed: {}", e)),
                    };

                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(ref cb) = callback {
                        cb(done, total);
                    }
                    result
                });
                (url, handle)
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for (url, task) in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!("[TrackFetcher] Task join error for {}: {}", url, e);
                    results.push(TrackFetchResult::failed(&url, None, format!("Task error: {}", e)));
                }
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        info!(
            "[TrackFetcher] Completed: {}/{} successful in {:.2}s",
            success_count,
            total,
            start.elapsed().as_secs_f64()
        );

        results
    }

    async fn fetch_single(
        client: &Client,
        config: &FetchConfig,
        rate_limiter: &RateLimiter,
        url: &str,
    ) -> TrackFetchResult {
        let mut retries = 0;

        loop {
            rate_limiter.acquire().await;

            let failure = match client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return match resp.text().await {
                            Ok(body) => TrackFetchResult::ok(url, body),
                            Err(e) => TrackFetchResult::failed(
                                url,
                                Some(status.as_u16()),
                                format!("Body error: {}", e),
                            ),
                        };
                    }
                    if !is_retryable(status) {
                        return TrackFetchResult::failed(url, Some(status.as_u16()), format!("HTTP {}", status));
                    }
                    (Some(status.as_u16()), format!("HTTP {}", status))
                }
                Err(e) => (None, format!("Request error: {}", e)),
            };

            retries += 1;
            if retries > config.max_retries {
                return TrackFetchResult::failed(url, failure.0, failure.1);
            }

            let backoff = config.backoff(retries);
            warn!(
                "[TrackFetcher] {} for {}, retry {} after {:?}",
                failure.1, url, retries, backoff
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

/// Blocking wrapper: runs the fetch on a dedicated tokio runtime.
pub fn fetch_payloads_blocking(
    config: FetchConfig,
    urls: Vec<String>,
    on_progress: Option<ProgressCallback>,
) -> Result<Vec<TrackFetchResult>> {
    let runtime = tokio::runtime::Runtime::new().map_err(|e| TramificationError::Http {
        message: format!("Failed to create tokio runtime: {}", e),
        status_code: None,
    })?;
    let fetcher = TrackFetcher::new(config)?;
    Ok(runtime.block_on(fetcher.fetch_payloads(urls, on_progress)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_first_request_is_immediate() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_rate_limiter_waits_when_window_full() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_backoff_doubles() {
        let config = FetchConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_millis(1000));
        assert_eq!(config.backoff(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_invalid_url_fails_without_retry() {
        let config = FetchConfig {
            max_retries: 0,
            ..Default::default()
        };
        let fetcher = TrackFetcher::new(config).unwrap();
        let progress = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&progress);
        let callback: ProgressCallback = Arc::new(move |done, _| seen.store(done, Ordering::Relaxed));

        let results = fetcher
            .fetch_payloads(vec!["not a url".to_string(), "also not".to_string()], Some(callback))
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].url, "not a url");
        assert!(results.iter().all(|r| !r.success && r.error.is_some()));
        assert_eq!(progress.load(Ordering::Relaxed), 2);

        let err = results[0].clone().into_payload().unwrap_err();
        assert!(matches!(err, TramificationError::Http { status_code: None, .. }));
    }
}
