//! Fetch collaborators: retrieve raw bytes for a source location

use crate::{PipelineError, Result, RetryConfig, SourceLocation, Stage};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, location: &SourceLocation) -> Result<Vec<u8>>;
}

/// Fetches `http`/`https` locations with reqwest and `file` locations from disk.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(user_agent) = user_agent {
            builder = builder.user_agent(user_agent);
        }

        let client = builder
            .build()
            .map_err(|e| PipelineError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self { client, timeout })
    }

    async fn fetch_file(&self, location: &SourceLocation) -> Result<Vec<u8>> {
        let path = location
            .url()
            .to_file_path()
            .map_err(|_| PipelineError::InvalidLocation(location.to_string()))?;

        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::fetch(location, e))
    }

    async fn fetch_http(&self, location: &SourceLocation) -> Result<Vec<u8>> {
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                PipelineError::Timeout {
                    stage: Stage::Fetch,
                    location: location.to_string(),
                    after: self.timeout,
                }
            } else {
                PipelineError::fetch(location, e)
            }
        };

        let response = self
            .client
            .get(location.url().clone())
            .send()
            .await
            .map_err(map_err)?
            .error_for_status()
            .map_err(map_err)?;

        let body = response.bytes().await.map_err(map_err)?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, location: &SourceLocation) -> Result<Vec<u8>> {
        match location.url().scheme() {
            "file" => self.fetch_file(location).await,
            _ => self.fetch_http(location).await,
        }
    }
}

/// Retries transient failures of the wrapped fetcher with exponential backoff.
pub struct RetryingFetcher<F> {
    inner: F,
    retry: RetryConfig,
}

impl<F: Fetcher> RetryingFetcher<F> {
    pub fn new(inner: F, retry: RetryConfig) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl<F: Fetcher> Fetcher for RetryingFetcher<F> {
    async fn fetch(&self, location: &SourceLocation) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.inner.fetch(location).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        "Retrying fetch of {} after {:?} (attempt {}/{})",
                        location,
                        delay,
                        attempt + 1,
                        self.retry.max_attempts
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        warn!("Giving up on {} after {} attempts: {}", location, attempt + 1, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn quick_retry(max_attempts: usize) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn location() -> SourceLocation {
        SourceLocation::parse("https://example.com/flaky.png").unwrap()
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let mut inner = MockFetcher::new();
        inner.expect_fetch().times(3).returning(move |loc| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(PipelineError::fetch(loc, "connection reset"))
            } else {
                Ok(vec![1, 2, 3])
            }
        });

        let fetcher = RetryingFetcher::new(inner, quick_retry(3));
        assert_eq!(fetcher.fetch(&location()).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let mut inner = MockFetcher::new();
        inner
            .expect_fetch()
            .times(2)
            .returning(|loc| Err(PipelineError::fetch(loc, "503 Service Unavailable")));

        let fetcher = RetryingFetcher::new(inner, quick_retry(2));
        assert!(matches!(
            fetcher.fetch(&location()).await,
            Err(PipelineError::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_skips_permanent_errors() {
        let mut inner = MockFetcher::new();
        inner
            .expect_fetch()
            .times(1)
            .returning(|loc| Err(PipelineError::InvalidLocation(loc.to_string())));

        let fetcher = RetryingFetcher::new(inner, quick_retry(5));
        assert!(fetcher.fetch(&location()).await.is_err());
    }

    #[tokio::test]
    async fn test_http_fetcher_reads_file_locations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.png");
        std::fs::write(&path, [7u8; 4]).unwrap();

        let url = url::Url::from_file_path(&path).unwrap();
        let location = SourceLocation::parse(url.as_str()).unwrap();
        let fetcher = HttpFetcher::new(Duration::from_secs(5), None).unwrap();

        assert_eq!(fetcher.fetch(&location).await.unwrap(), vec![7u8; 4]);

        let missing = SourceLocation::parse(
            url::Url::from_file_path(dir.path().join("missing.png")).unwrap().as_str(),
        )
        .unwrap();
        assert!(matches!(
            fetcher.fetch(&missing).await,
            Err(PipelineError::Fetch { .. })
        ));
    }
}
