use std::future::Future;
use std::time::Duration;

use crate::error::AppResult;
use crate::utils::cancel::CancelToken;

/// Exponential backoff between attempts of a supervised loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
    multiplier: u32,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: 2,
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(self.multiplier).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Runs `task` until `shutdown` fires.
///
/// A failed attempt is followed by a backoff sleep that grows with each
/// consecutive failure; a successful one resets the backoff and the task is
/// invoked again straight away. Cancellation is checked before every attempt
/// and also ends a backoff sleep early.
pub async fn run_with_retry<F, Fut>(shutdown: &CancelToken, policy: RetryPolicy, name: &str, mut task: F)
where
    F: FnMut(CancelToken) -> Fut,
    Fut: Future<Output = AppResult<()>>,
{
    let mut backoff = policy.initial();

    loop {
        if shutdown.is_cancelled() {
            tracing::debug!(task = name, "Stopping supervised task");
            return;
        }

        match task(shutdown.clone()).await {
            Ok(()) => backoff = policy.initial(),
            Err(e) => {
                tracing::error!(
                    task = name,
                    error = %e,
                    backoff_ms = backoff.as_millis() as u64,
                    "Supervised task failed, retrying"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!(task = name, "Stopping supervised task during backoff");
                        return;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = policy.next_backoff(backoff);
            }
        }
    }
}
