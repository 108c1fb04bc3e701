//! Retry helpers for transient API failures.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// First back-off between attempts.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound for the back-off between attempts.
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Outcome of a failed attempt inside [`retry`].
#[derive(Debug)]
pub enum RetryError {
    /// Try again after a back-off, until the timeout.
    Retryable(ProviderError),
    /// Give up immediately.
    NonRetryable(ProviderError),
}

impl RetryError {
    /// Wrap an error as retryable.
    pub fn retryable(err: impl Into<ProviderError>) -> Self {
        Self::Retryable(err.into())
    }

    /// Wrap an error as non-retryable.
    pub fn non_retryable(err: impl Into<ProviderError>) -> Self {
        Self::NonRetryable(err.into())
    }

    /// Retryable when [`need_retry`] holds or the API code is one of `codes`.
    pub fn classify(err: impl Into<ProviderError>, codes: &[&str]) -> Self {
        let err = err.into();
        let expected = matches!(&err, ProviderError::Api(api) if api.is_expected(codes));
        if expected || need_retry(&err) {
            Self::Retryable(err)
        } else {
            Self::NonRetryable(err)
        }
    }
}

/// Whether an error is transient regardless of the operation.
///
/// Throttling, service-unavailable and busy codes, any HTTP 5xx, and
/// requests that never got a response.
pub fn need_retry(err: &ProviderError) -> bool {
    match err.root() {
        ProviderError::Api(api) => {
            api.is_transport()
                || api.is_throttling()
                || api.code.starts_with("ServiceUnavailable")
                || api.code == "SystemBusy"
                || api.http_status >= 500
        }
        ProviderError::Unavailable(_) => true,
        _ => false,
    }
}

/// Call `op` until it succeeds, fails permanently, or `timeout` elapses.
///
/// Back-off starts at [`INITIAL_BACKOFF`], doubles after each attempt and is
/// capped at [`MAX_BACKOFF`]. When the timeout is hit the last error is
/// returned.
pub async fn retry<T, F, Fut>(timeout: Duration, mut op: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    let deadline = Instant::now() + timeout;
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 1u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(RetryError::NonRetryable(err)) => return Err(err),
            Err(RetryError::Retryable(err)) => {
                let now = Instant::now();
                if now >= deadline {
                    warn!(attempt, error = %err, "giving up after retry timeout");
                    return Err(err);
                }
                let sleep = backoff.min(deadline - now);
                debug!(attempt, error = %err, sleep = ?sleep, "retryable error");
                tokio::time::sleep(sleep).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                attempt += 1;
            }
        }
    }
}

/// Linearly growing sleep for use inside retry bodies.
///
/// The n-th call to [`IncrementalWait::wait`] sleeps `first + (n-1) * step`.
#[derive(Debug)]
pub struct IncrementalWait {
    first: Duration,
    step: Duration,
    calls: AtomicU32,
}

impl IncrementalWait {
    /// Create a wait starting at `first` and growing by `step`.
    pub fn new(first: Duration, step: Duration) -> Self {
        Self {
            first,
            step,
            calls: AtomicU32::new(0),
        }
    }

    /// The delay the next call to [`wait`](Self::wait) will use, advancing the counter.
    pub fn next_delay(&self) -> Duration {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.first + self.step * n
    }

    /// Sleep for the next delay.
    pub async fn wait(&self) {
        tokio::time::sleep(self.next_delay()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ApiError;
    use std::sync::atomic::AtomicUsize;

    fn throttled() -> ProviderError {
        ApiError::new("Throttling.User", "Request was denied due to user flow control.", 400)
            .into()
    }

    #[test]
    fn test_need_retry() {
        assert!(need_retry(&throttled()));
        assert!(need_retry(&ApiError::new("ServiceUnavailable", "", 503).into()));
        assert!(need_retry(&ApiError::new("SystemBusy", "", 400).into()));
        assert!(need_retry(&ApiError::new("UnknownError", "", 500).into()));
        assert!(need_retry(&ApiError::unreachable("refused").into()));
        assert!(need_retry(&ApiError::timeout("slow").into()));
        assert!(!need_retry(&ApiError::new("InvalidParameter", "", 400).into()));
        assert!(!need_retry(&ProviderError::Validation("bad".to_string())));
    }

    #[test]
    fn test_classify() {
        let err = ApiError::new("IncorrectVSwitchStatus", "", 400);
        assert!(matches!(
            RetryError::classify(err.clone(), &["IncorrectVSwitchStatus"]),
            RetryError::Retryable(_)
        ));
        assert!(matches!(
            RetryError::classify(err, &[]),
            RetryError::NonRetryable(_)
        ));
        assert!(matches!(
            RetryError::classify(throttled(), &[]),
            RetryError::Retryable(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let start = Instant::now();
        let result = retry(Duration::from_secs(60), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(RetryError::retryable(throttled()))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        // 500ms + 1s + 2s
        assert_eq!(start.elapsed(), Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_non_retryable() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), _> = retry(Duration::from_secs(60), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RetryError::non_retryable(ProviderError::Validation(
                "bad".to_string(),
            )))
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timeout_returns_last_error() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let start = Instant::now();
        let result: Result<(), _> = retry(Duration::from_secs(30), move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(RetryError::retryable(ApiError::new(
                "Throttling",
                format!("attempt {}", n),
                400,
            )))
        })
        .await;

        let err = result.unwrap_err();
        let last = calls.load(Ordering::SeqCst) - 1;
        assert_eq!(err.message(), format!("attempt {}", last));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_capped() {
        let start = Instant::now();
        let recorded = std::sync::Mutex::new(Vec::new());
        let stamps = &recorded;
        let _: Result<(), _> = retry(Duration::from_secs(60), move || async move {
            stamps.lock().unwrap().push(start.elapsed());
            Err(RetryError::retryable(throttled()))
        })
        .await;

        let stamps = recorded.into_inner().unwrap();
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps[0], Duration::from_millis(500));
        assert_eq!(gaps[4], Duration::from_secs(8));
        assert_eq!(gaps[5], Duration::from_secs(10));
        assert_eq!(gaps[6], Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_wait() {
        let wait = IncrementalWait::new(Duration::from_secs(3), Duration::from_secs(2));
        let start = Instant::now();
        wait.wait().await;
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        wait.wait().await;
        assert_eq!(start.elapsed(), Duration::from_secs(8));
        assert_eq!(wait.next_delay(), Duration::from_secs(7));
    }
}
