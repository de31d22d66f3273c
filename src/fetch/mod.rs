//! Resource fetching with a bounded, fixed-delay retry policy.
//!
//! A [`Fetch`] implementation performs one attempt; [`ResourceFetcher`] wraps
//! it with the retry loop so the policy stays independent of the transport.

mod http;

pub use http::{HttpFetcher, USER_AGENT};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

/// Default number of attempts per URL.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Errors from a single fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),
}

/// One attempt at downloading a resource.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Outcome of fetching one URL.
#[derive(Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(Arc<[u8]>),
    Failed { reason: String, attempts: u32 },
}

impl std::fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchOutcome::Fetched(data) => write!(f, "Fetched({} bytes)", data.len()),
            FetchOutcome::Failed { reason, attempts } => f
                .debug_struct("Failed")
                .field("reason", reason)
                .field("attempts", attempts)
                .finish(),
        }
    }
}

/// Result of fetching one distinct URL.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub url: String,
    pub outcome: FetchOutcome,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, FetchOutcome::Fetched(_))
    }
}

/// Downloads resources through a [`Fetch`] transport with retries.
#[derive(Clone)]
pub struct ResourceFetcher {
    transport: Arc<dyn Fetch>,
    policy: RetryPolicy,
}

impl ResourceFetcher {
    pub fn new(transport: Arc<dyn Fetch>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Fetch `url`, retrying failed attempts up to the policy's limit.
    ///
    /// Never returns an error: exhausting all attempts yields
    /// [`FetchOutcome::Failed`] carrying the last error.
    pub async fn fetch(&self, url: &str) -> FetchResult {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("Fetching {} (attempt {}/{})", url, attempt, max_attempts);

            match self.transport.get_bytes(url).await {
                Ok(bytes) => {
                    debug!("Fetched {} ({} bytes)", url, bytes.len());
                    return FetchResult {
                        url: url.to_string(),
                        outcome: FetchOutcome::Fetched(Arc::from(bytes)),
                    };
                }
                Err(e) => {
                    warn!(
                        "Fetch failed for {} (attempt {}/{}): {}",
                        url, attempt, max_attempts, e
                    );
                    if attempt >= max_attempts {
                        return FetchResult {
                            url: url.to_string(),
                            outcome: FetchOutcome::Failed {
                                reason: e.to_string(),
                                attempts: attempt,
                            },
                        };
                    }
                    tokio::time::sleep(self.policy.delay).await;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{quick_policy, ScriptedFetch};
    use super::*;

    #[tokio::test]
    async fn test_fetch_succeeds_first_try() {
        let transport = Arc::new(ScriptedFetch::new().with_body("http://x/a.png", b"img"));
        let fetcher = ResourceFetcher::new(transport.clone(), quick_policy());

        let result = fetcher.fetch("http://x/a.png").await;

        assert_eq!(result.outcome, FetchOutcome::Fetched(Arc::from(&b"img"[..])));
        assert_eq!(transport.calls_for("http://x/a.png"), 1);
    }

    #[tokio::test]
    async fn test_fetch_recovers_after_transient_failures() {
        let transport = Arc::new(
            ScriptedFetch::new()
                .with_body("http://x/a.png", b"img")
                .failing_first("http://x/a.png", 2),
        );
        let fetcher = ResourceFetcher::new(transport.clone(), quick_policy());

        let result = fetcher.fetch("http://x/a.png").await;

        assert!(result.is_success());
        assert_eq!(transport.calls_for("http://x/a.png"), 3);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_max_attempts() {
        let transport = Arc::new(ScriptedFetch::new());
        let fetcher = ResourceFetcher::new(transport.clone(), quick_policy());

        let result = fetcher.fetch("http://x/missing.png").await;

        match result.outcome {
            FetchOutcome::Failed { reason, attempts } => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "HTTP 404");
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(transport.calls_for("http://x/missing.png"), 3);
    }

    #[tokio::test]
    async fn test_persistent_server_errors_report_last_status() {
        let transport = Arc::new(
            ScriptedFetch::new()
                .with_body("http://x/a.png", b"img")
                .failing_first("http://x/a.png", 5),
        );
        let fetcher = ResourceFetcher::new(transport.clone(), quick_policy());

        let result = fetcher.fetch("http://x/a.png").await;

        match result.outcome {
            FetchOutcome::Failed { reason, attempts } => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "HTTP 503");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_attempt_policy_still_tries_once() {
        let transport = Arc::new(ScriptedFetch::new());
        let policy = RetryPolicy {
            max_attempts: 0,
            delay: Duration::ZERO,
        };
        let fetcher = ResourceFetcher::new(transport.clone(), policy);

        let result = fetcher.fetch("http://x/missing.png").await;

        assert!(!result.is_success());
        assert_eq!(transport.calls_for("http://x/missing.png"), 1);
    }
}
