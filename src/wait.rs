//! Polling until a remote object reaches a state.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ProviderError;

/// Default pause between refreshes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// What a refresh function reports: the object and its state, or `None` once
/// the object is gone.
pub type Refresh<T> = Result<Option<(T, String)>, ProviderError>;

/// Waits for an object to move from `pending` states into a `target` state.
///
/// An empty `target` means "wait until the object is gone". States that are
/// neither pending nor target end the wait with an error, as do explicit fail
/// states.
#[derive(Debug, Clone)]
pub struct StateWaiter {
    /// States that keep the wait going.
    pub pending: Vec<String>,
    /// States that end the wait successfully.
    pub target: Vec<String>,
    /// States that end the wait with an error.
    pub fail: Vec<String>,
    /// Total time allowed.
    pub timeout: Duration,
    /// Pause before the first refresh.
    pub delay: Duration,
    /// Pause between refreshes.
    pub poll_interval: Duration,
}

impl StateWaiter {
    /// Create a waiter.
    pub fn new(pending: &[&str], target: &[&str], timeout: Duration) -> Self {
        Self {
            pending: pending.iter().map(|s| s.to_string()).collect(),
            target: target.iter().map(|s| s.to_string()).collect(),
            fail: Vec::new(),
            timeout,
            delay: Duration::ZERO,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Wait until the object disappears.
    pub fn until_gone(pending: &[&str], timeout: Duration) -> Self {
        Self::new(pending, &[], timeout)
    }

    /// Set fail states.
    pub fn with_fail(mut self, fail: &[&str]) -> Self {
        self.fail = fail.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Set the initial delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll `refresh` until a target state is reached.
    ///
    /// Returns the last object seen, or `None` when waiting for deletion.
    pub async fn wait<T, F, Fut>(&self, mut refresh: F) -> Result<Option<T>, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Refresh<T>>,
    {
        let deadline = Instant::now() + self.timeout;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        loop {
            let last_state = match refresh().await? {
                None => {
                    if self.target.is_empty() {
                        return Ok(None);
                    }
                    String::from("<gone>")
                }
                Some((object, state)) => {
                    if self.target.iter().any(|t| *t == state) {
                        debug!(state = %state, "target state reached");
                        return Ok(Some(object));
                    }
                    if self.fail.iter().any(|f| *f == state) {
                        return Err(ProviderError::FailedPrecondition(format!(
                            "entered failure state {:?} while waiting for {:?}",
                            state, self.target
                        )));
                    }
                    if !self.pending.iter().any(|p| *p == state) {
                        return Err(ProviderError::FailedPrecondition(format!(
                            "unexpected state {:?}, wanted target {:?}",
                            state, self.target
                        )));
                    }
                    state
                }
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(last_state = %last_state, timeout = ?self.timeout, "state wait timed out");
                return Err(ProviderError::DeadlineExceeded(format!(
                    "timeout while waiting for state to become {:?} (last state: {:?}, timeout: {:?})",
                    self.target, last_state, self.timeout
                )));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

/// Poll `check` every `interval` until it returns `true` or `timeout` elapses.
pub async fn wait_for<F, Fut>(
    what: &str,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> Result<(), ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ProviderError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ProviderError::DeadlineExceeded(format!(
                "timed out after {:?} waiting for {}",
                timeout, what
            )));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn sequence(states: &[Option<&str>]) -> Mutex<Vec<Option<String>>> {
        Mutex::new(
            states
                .iter()
                .rev()
                .map(|s| s.map(|s| s.to_string()))
                .collect(),
        )
    }

    fn next(states: &Mutex<Vec<Option<String>>>) -> Refresh<u32> {
        let mut states = states.lock().unwrap();
        let state = if states.len() > 1 {
            states.pop().flatten()
        } else {
            states.last().cloned().flatten()
        };
        Ok(state.map(|s| (7, s)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_target() {
        let states = sequence(&[Some("Pending"), Some("Starting"), Some("Running")]);
        let states = &states;
        let start = Instant::now();
        let waiter = StateWaiter::new(&["Pending", "Starting"], &["Running"], Duration::from_secs(60))
            .with_poll_interval(Duration::from_secs(2));
        let object = waiter.wait(move || async move { next(states) }).await.unwrap();
        assert_eq!(object, Some(7));
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_with_empty_target() {
        let states = sequence(&[Some("Stopping"), None]);
        let states = &states;
        let waiter = StateWaiter::until_gone(&["Stopping"], Duration::from_secs(60));
        let object = waiter.wait(move || async move { next(states) }).await.unwrap();
        assert_eq!(object, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gone_keeps_waiting_for_target() {
        let states = sequence(&[None, None, Some("Running")]);
        let states = &states;
        let waiter = StateWaiter::new(&["Pending"], &["Running"], Duration::from_secs(60));
        assert_eq!(waiter.wait(move || async move { next(states) }).await.unwrap(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_and_fail_states() {
        let states = sequence(&[Some("Pending"), Some("Deleted")]);
        let states_ref = &states;
        let waiter = StateWaiter::new(&["Pending"], &["Running"], Duration::from_secs(60));
        let err = waiter
            .wait(move || async move { next(states_ref) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unexpected state \"Deleted\""));

        let states = sequence(&[Some("Pending"), Some("Stopping")]);
        let states_ref = &states;
        let waiter = StateWaiter::new(&["Pending", "Stopping"], &["Running"], Duration::from_secs(60))
            .with_fail(&["Stopping"]);
        let err = waiter
            .wait(move || async move { next(states_ref) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failure state \"Stopping\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_names_last_state() {
        let states = sequence(&[Some("Stopping")]);
        let states = &states;
        let start = Instant::now();
        let waiter = StateWaiter::new(&["Stopping"], &["Stopped"], Duration::from_secs(30))
            .with_delay(Duration::from_secs(3));
        let err = waiter
            .wait(move || async move { next(states) })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::DeadlineExceeded(_)));
        assert!(err.to_string().contains("Stopping"));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_gone_names_gone() {
        let states = sequence(&[None]);
        let states = &states;
        let waiter = StateWaiter::new(&["Pending"], &["Running"], Duration::from_secs(10));
        let err = waiter
            .wait(move || async move { next(states) })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("<gone>"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for() {
        let counter = std::sync::atomic::AtomicU32::new(0);
        let calls = &counter;
        wait_for("thing", Duration::from_secs(10), Duration::from_secs(1), move || async move {
            Ok(calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 2)
        })
        .await
        .unwrap();

        let err = wait_for("never", Duration::from_secs(5), Duration::from_secs(2), || async {
            Ok(false)
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("waiting for never"));
    }
}
