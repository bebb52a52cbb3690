//! Bounded retry with exponential backoff.
//!
//! [`run`] is a plain loop: call the operation, and on a retryable failure
//! sleep [`RetryPolicy::delay_for`] and try again, up to `max_attempts`.
//! The attempt count and the total time spent backing off are returned with
//! the result so callers (and tests) can inspect them.

use std::future::Future;
use std::time::Duration;

use crate::cancel::CancelSignal;
use crate::config::RetryConfig;
use crate::error::ScrapeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    /// Upper bound applied to upstream `Retry-After` hints.
    pub max_retry_after: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            min_backoff: Duration::from_millis(config.min_backoff_ms),
            max_retry_after: Duration::from_secs(config.max_retry_after_secs),
        }
    }

    /// Delay before attempt `attempt + 1`, after attempt `attempt` (1-based)
    /// failed: `hint + min_backoff * 2^(attempt-1)`, with the hint capped at
    /// `max_retry_after`. The hint is a floor and the exponential part keeps
    /// the delay growing even when the upstream repeats the same hint.
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let computed = self
            .min_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(Duration::MAX);
        let hint = hint.map(|h| h.min(self.max_retry_after)).unwrap_or_default();
        hint.saturating_add(computed)
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded {
        value: T,
        attempts: u32,
        backoff: Duration,
    },
    Failed {
        error: ScrapeError,
        attempts: u32,
        backoff: Duration,
    },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn backoff(&self) -> Duration {
        match self {
            Self::Succeeded { backoff, .. } | Self::Failed { backoff, .. } => *backoff,
        }
    }

    pub fn into_result(self) -> Result<T, ScrapeError> {
        match self {
            Self::Succeeded { value, .. } => Ok(value),
            Self::Failed { error, .. } => Err(error),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out of
/// attempts, or `cancel` fires during a backoff sleep (reported as
/// [`ScrapeError::Cancelled`]). `op` receives the 1-based attempt number.
pub async fn run<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelSignal,
    label: &str,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ScrapeError>>,
{
    let mut backoff = Duration::ZERO;
    let mut attempt = 1;
    loop {
        let error = match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                    backoff,
                }
            }
            Err(e) => e,
        };

        if !error.is_retryable() || attempt >= policy.max_attempts {
            return RetryOutcome::Failed {
                error,
                attempts: attempt,
                backoff,
            };
        }

        let delay = policy.delay_for(attempt, error.retry_after());
        tracing::warn!(
            label,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after backoff"
        );
        let mut cancel = cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return RetryOutcome::Failed {
                    error: ScrapeError::Cancelled,
                    attempts: attempt,
                    backoff,
                };
            }
        }
        backoff += delay;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            min_backoff: Duration::from_secs(2),
            max_retry_after: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_delay_grows_from_min_backoff() {
        let p = policy();
        let delays: Vec<_> = (1..=4).map(|n| p.delay_for(n, None)).collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        assert!(delays.windows(2).all(|w| w[1] > w[0]));
        assert!(delays.iter().all(|d| *d >= p.min_backoff));
    }

    #[test]
    fn test_hint_is_a_floor_and_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(30))), Duration::from_secs(32));
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(3600))), Duration::from_secs(62));
        assert_eq!(p.delay_for(3, Some(Duration::from_secs(1))), Duration::from_secs(9));
    }

    #[test]
    fn test_repeated_hint_still_increases() {
        let p = RetryPolicy {
            max_attempts: 4,
            min_backoff: Duration::from_secs(2),
            max_retry_after: Duration::from_secs(300),
        };
        let hint = Some(Duration::from_secs(60));
        let delays: Vec<_> = (1..=3).map(|n| p.delay_for(n, hint)).collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(62), Duration::from_secs(64), Duration::from_secs(68)]
        );
        assert!(delays.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_accumulates_hint_and_growth() {
        let outcome: RetryOutcome<()> = run(&policy(), &CancelSignal::never(), "page", |_| async {
            Err(ScrapeError::RateLimited {
                retry_after: Some(Duration::from_secs(10)),
            })
        })
        .await;
        assert_eq!(outcome.attempts(), 4);
        assert_eq!(outcome.backoff(), Duration::from_secs(12 + 14 + 18));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let p = policy();
        assert_eq!(p.delay_for(200, None), p.delay_for(32, None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let outcome = run(&policy(), &CancelSignal::never(), "page", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ScrapeError::Transport("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(outcome.backoff(), Duration::from_secs(2 + 4));
        assert_eq!(outcome.into_result().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_not_retried() {
        let outcome: RetryOutcome<()> = run(&policy(), &CancelSignal::never(), "page", |_| async {
            Err(ScrapeError::AuthFailed("nope".into()))
        })
        .await;
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.backoff(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let outcome: RetryOutcome<()> = run(&policy(), &CancelSignal::never(), "page", |_| async {
            Err(ScrapeError::RateLimited { retry_after: None })
        })
        .await;
        assert_eq!(outcome.attempts(), 4);
        assert_eq!(outcome.backoff(), Duration::from_secs(2 + 4 + 8));
        assert!(matches!(
            outcome.into_result(),
            Err(ScrapeError::RateLimited { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let handle = CancelHandle::new();
        let signal = handle.signal();
        let task = tokio::spawn(async move {
            run::<(), _, _>(&policy(), &signal, "page", |_| async {
                Err(ScrapeError::Transport("down".into()))
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(500)).await;
        handle.cancel();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome.into_result(), Err(ScrapeError::Cancelled)));
    }
}
