use crate::coordinator::SyncOutcome;
use crate::error::SyncError;
use crate::runtime::CoordinatorHandle;
use statline_core::CategoryScope;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_step: DEFAULT_BACKOFF_STEP,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_step: Duration::ZERO,
        }
    }

    /// Linear backoff: the wait after attempt `n` is `n * backoff_step`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryReport {
    pub outcome: SyncOutcome,
    pub attempts: u32,
}

/// Runs a sync, re-issuing it after a failed outcome or an unavailable
/// transport until the policy runs out. A range error is returned at once.
///
/// When every attempt fails the last failed outcome is returned; a transport
/// error on the final attempt is returned as the error.
pub async fn sync_with_retry(
    handle: &CoordinatorHandle,
    scope: &CategoryScope,
    from: i64,
    to: i64,
    policy: &RetryPolicy,
) -> Result<RetryReport, SyncError> {
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        let last = attempt == attempts;
        match handle.run_sync(scope.clone(), from, to).await {
            Ok(outcome) if outcome.is_success() || last => {
                return Ok(RetryReport { outcome, attempts: attempt });
            }
            Ok(outcome) => {
                warn!(
                    event = "sync_retry",
                    stream = handle.stream(),
                    attempt,
                    correlation_id = %outcome.correlation_id,
                    reason = ?outcome.reason.as_ref().map(ToString::to_string)
                );
            }
            Err(err) if err.is_retryable() && !last => {
                warn!(
                    event = "sync_retry",
                    stream = handle.stream(),
                    attempt,
                    error = %err
                );
            }
            Err(err) => return Err(err),
        }

        let delay = policy.delay_after(attempt);
        info!(
            event = "sync_backoff",
            stream = handle.stream(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
