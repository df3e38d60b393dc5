//! Bounded exponential backoff for transient storage errors.

use std::future::Future;

use storage::{StorageError, StorageErrorKind};

/// A policy for retrying storage operations with exponential backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    /// The current delay before the next retry
    pub delay: std::time::Duration,

    /// The exponent to increase the delay by
    pub exponent: u32,

    /// The maximum delay; reaching it ends the retries
    pub max_delay: std::time::Duration,
}

impl Backoff {
    /// Create a new backoff policy.
    pub fn new(delay: std::time::Duration, exponent: u32, max_delay: std::time::Duration) -> Self {
        Self {
            delay,
            exponent,
            max_delay,
        }
    }

    /// Increment the backoff delay, or `None` once the maximum is reached.
    pub fn increment(&self) -> Option<Self> {
        let delay = self.delay.checked_mul(self.exponent)?;

        if delay >= self.max_delay {
            return None;
        }

        Some(Self {
            delay,
            exponent: self.exponent,
            max_delay: self.max_delay,
        })
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            std::time::Duration::from_millis(50),
            2,
            std::time::Duration::from_secs(2),
        )
    }
}

/// Run a storage operation, retrying transient failures under the given
/// backoff policy. Non-retryable errors are returned immediately; once the
/// policy is exhausted the last error is wrapped as `RetriesExhausted`.
pub(crate) async fn with_retries<T, F, Fut>(
    backoff: Backoff,
    mut operation: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut current = backoff;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => match current.increment() {
                Some(next) => {
                    tracing::debug!(delay=?current.delay, "retrying storage operation: {err}");
                    tokio::time::sleep(current.delay).await;
                    current = next;
                }
                None => {
                    return Err(StorageError::new(
                        "retry",
                        StorageErrorKind::RetriesExhausted,
                        err,
                    ));
                }
            },
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_increments_until_max() {
        let backoff = Backoff::new(
            std::time::Duration::from_millis(100),
            2,
            std::time::Duration::from_millis(500),
        );

        let next = backoff.increment().unwrap();
        assert_eq!(next.delay, std::time::Duration::from_millis(200));
        let next = next.increment().unwrap();
        assert_eq!(next.delay, std::time::Duration::from_millis(400));
        assert!(next.increment().is_none());
    }

    #[tokio::test]
    async fn non_retryable_errors_return_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retries(Backoff::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StorageError::new(
                    "test",
                    StorageErrorKind::NotFound,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                ))
            }
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_errors_are_retried_to_exhaustion() {
        let calls = AtomicUsize::new(0);
        let backoff = Backoff::new(
            std::time::Duration::from_millis(1),
            2,
            std::time::Duration::from_millis(4),
        );
        let result: Result<(), _> = with_retries(backoff, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StorageError::new(
                    "test",
                    StorageErrorKind::ServiceUnavailable,
                    std::io::Error::other("unavailable"),
                ))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::RetriesExhausted);
        assert!(calls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn eventual_success_is_returned() {
        let calls = AtomicUsize::new(0);
        let backoff = Backoff::new(
            std::time::Duration::from_millis(1),
            2,
            std::time::Duration::from_secs(1),
        );
        let result = with_retries(backoff, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(StorageError::new(
                        "test",
                        StorageErrorKind::Io,
                        std::io::Error::other("flaky"),
                    ))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
    }
}
