//! Bounded exponential-backoff retry with cooperative cancellation.
//!
//! Stages wrap every external call in [`retry`]. The elapsed budget covers
//! the whole retried closure, so admission-permit acquisition happens inside
//! the closure and counts against the budget.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Backoff parameters for one class of external operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first re-attempt.
    pub initial_interval: Duration,
    /// Cap on the per-attempt delay.
    pub max_interval: Duration,
    /// Total budget across all attempts, acquisition included.
    pub max_elapsed: Duration,
    /// Maximum number of re-attempts after the first try.
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Profile for AI calls: 30 s elapsed, 100 ms initial, 1 s cap, 3 retries.
    pub fn ai() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(30),
            max_retries: 3,
        }
    }

    /// Profile for thumbnail batches: 20 s elapsed, 5 s initial, 6 s cap,
    /// 3 retries. Thumbnail generation is slow to converge, so attempts are
    /// spaced widely.
    pub fn thumbnail() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(6),
            max_elapsed: Duration::from_secs(20),
            max_retries: 3,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_interval;
        for _ in 0..attempt {
            delay = (delay * 2).min(self.max_interval);
        }
        delay.min(self.max_interval)
    }
}

/// Execute `op` with exponential backoff.
///
/// Stops on success, a non-retryable error, retry exhaustion, an exceeded
/// elapsed budget, or cancellation. Cancellation during backoff returns
/// [`Error::Cancelled`] immediately.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err) => {
                if attempt >= policy.max_retries || !err.is_retryable() {
                    return Err(err);
                }

                // Give up rather than back off past the elapsed budget.
                let delay = policy.delay_for_attempt(attempt);
                if started.elapsed() + delay >= policy.max_elapsed {
                    return Err(err);
                }

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Acquire one admission unit, racing the cancellation signal.
pub async fn acquire<'a>(
    semaphore: &'a Semaphore,
    cancel: &CancellationToken,
) -> Result<SemaphorePermit<'a>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        permit = semaphore.acquire() => {
            permit.map_err(|_| Error::Llm("admission semaphore closed".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_op(
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<usize>> + Send>> {
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call <= fail_first {
                    Err(Error::Llm("429 rate limit exceeded".to_string()))
                } else {
                    Ok(call)
                }
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let result = retry(&RetryPolicy::ai(), &cancel, counting_op(Arc::clone(&calls), 2)).await;

        assert_eq!(result.expect("third attempt succeeds"), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let result = retry(
            &RetryPolicy::ai(),
            &cancel,
            counting_op(Arc::clone(&calls), usize::MAX),
        )
        .await;

        assert!(result.is_err());
        // First try plus max_retries re-attempts.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_immediate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&calls);

        let result: Result<()> = retry(&RetryPolicy::ai(), &cancel, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::invalid_response("bad shape"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidResponse(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = retry(&RetryPolicy::ai(), &cancel, || async {
            panic!("op must not run after cancellation")
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            child.cancel();
        });

        // Thumbnail policy backs off 5 s, far past the cancellation point.
        let result: Result<()> = retry(&RetryPolicy::thumbnail(), &cancel, || async {
            Err(Error::PendingThumbnails)
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_budget_bounds_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&calls);

        let policy = RetryPolicy {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(15),
            max_retries: 100,
        };

        let result: Result<()> = retry(&policy, &cancel, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Llm("timeout".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        // 0 s try, 10 s backoff, 10 s try again, budget exceeded.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_respects_cancellation() {
        let semaphore = Semaphore::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = acquire(&semaphore, &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_acquire_grants_permit() {
        let semaphore = Semaphore::new(1);
        let cancel = CancellationToken::new();

        let permit = acquire(&semaphore, &cancel).await;
        assert!(permit.is_ok());
        assert_eq!(semaphore.available_permits(), 0);
        drop(permit);
        assert_eq!(semaphore.available_permits(), 1);
    }

    #[test]
    fn test_delay_doubles_to_cap() {
        let policy = RetryPolicy::ai();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
    }
}
