use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{header::CONTENT_TYPE, RequestBuilder, StatusCode};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

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
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Per-request knobs supplied by a source's settings.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum HttpFetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher concurrency limiter closed")]
    LimiterClosed,
}

#[derive(Debug)]
struct FetchLimits {
    global: Semaphore,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

/// Shared HTTP client with bounded concurrency and retry/backoff.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    config: HttpClientConfig,
    limits: Arc<FetchLimits>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = build_client(&config, false)?;
        let limits = Arc::new(FetchLimits {
            global: Semaphore::new(config.global_concurrency.max(1)),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        });
        Ok(Self {
            client,
            config,
            limits,
        })
    }

    /// A fetcher with its own cookie jar that shares this fetcher's concurrency limits.
    pub fn session(&self) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(&self.config, true)?,
            config: self.config.clone(),
            limits: Arc::clone(&self.limits),
        })
    }

    async fn per_source_semaphore(&self, source: &str) -> Arc<Semaphore> {
        let mut map = self.limits.per_source.lock().await;
        map.entry(source.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.limits.per_source_limit)))
            .clone()
    }

    pub async fn get(
        &self,
        source: &str,
        url: &str,
        options: &FetchOptions,
    ) -> Result<FetchedResponse, HttpFetchError> {
        let span = info_span!("http_fetch", source, url, method = "GET");
        self.send_with_retry(source, || self.decorate(self.client.get(url), options), true)
            .instrument(span)
            .await
    }

    /// Single-attempt form POST; login requests are never replayed.
    pub async fn post_form(
        &self,
        source: &str,
        url: &str,
        form: &[(String, String)],
        options: &FetchOptions,
    ) -> Result<FetchedResponse, HttpFetchError> {
        let span = info_span!("http_fetch", source, url, method = "POST");
        self.send_with_retry(
            source,
            || self.decorate(self.client.post(url).form(form), options),
            false,
        )
        .instrument(span)
        .await
    }

    fn decorate(&self, mut builder: RequestBuilder, options: &FetchOptions) -> RequestBuilder {
        for (name, value) in &options.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }

    async fn send_with_retry<F>(
        &self,
        source: &str,
        build: F,
        retry: bool,
    ) -> Result<FetchedResponse, HttpFetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let _global = self
            .limits
            .global
            .acquire()
            .await
            .map_err(|_| HttpFetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| HttpFetchError::LimiterClosed)?;

        let max_retries = if retry { self.config.backoff.max_retries } else { 0 };
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && attempt < max_retries {
                        debug!(attempt, status = status.as_u16(), "retrying http fetch");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(HttpFetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && attempt < max_retries {
                        debug!(attempt, error = %err, "retrying http fetch");
                        tokio::time::sleep(self.config.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpFetchError::Request(err));
                }
            }
        }
    }
}

fn build_client(config: &HttpClientConfig, cookies: bool) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .cookie_store(cookies)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn sessions_share_concurrency_limits() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let session = fetcher.session().expect("session");
        assert!(Arc::ptr_eq(&fetcher.limits, &session.limits));
        let a = fetcher.per_source_semaphore("feed").await;
        let b = session.per_source_semaphore("feed").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
