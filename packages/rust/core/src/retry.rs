//! Composable retry policies.
//!
//! The pipeline stacks two of these: an inner policy around the transport
//! call and an outer policy around invoke-and-validate. Both share this one
//! loop body.

use std::future::Future;

use tracing::{info, warn};

use cardpipe_shared::CardpipeError;

use crate::backoff::Backoff;
use crate::classify::{Classifier, Retryability};

/// Attempt budget plus the backoff used between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub struct RetryFailure {
    /// The last error observed.
    pub error: CardpipeError,
    /// `Terminal` if the loop stopped early, `Retryable` if the budget ran out.
    pub retryability: Retryability,
    /// Attempts made, including the failing one.
    pub attempts: u32,
}

impl std::fmt::Display for RetryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.retryability {
            Retryability::Terminal => write!(f, "{} (not retryable)", self.error),
            Retryability::Retryable => write!(
                f,
                "{} (gave up after {} attempts)",
                self.error, self.attempts
            ),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it succeeds, fails terminally, or the budget is spent.
    ///
    /// `op` receives the zero-based attempt index. Every error is classified;
    /// terminal errors stop the loop immediately without consuming the rest
    /// of the budget.
    pub async fn run<T, F, Fut>(
        &self,
        classifier: &Classifier,
        layer: &'static str,
        mut op: F,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CardpipeError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(layer, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let retryability = classifier.classify(&error);
                    let attempts = attempt + 1;

                    if retryability == Retryability::Terminal {
                        warn!(layer, attempt = attempts, cause = %error, "non-retryable failure");
                        return Err(RetryFailure {
                            error,
                            retryability,
                            attempts,
                        });
                    }

                    if attempt >= self.max_retries {
                        warn!(layer, attempts, cause = %error, "retry budget exhausted");
                        return Err(RetryFailure {
                            error,
                            retryability,
                            attempts,
                        });
                    }

                    let delay = self.backoff.delay(attempt);
                    warn!(
                        layer,
                        attempt = attempts,
                        of = self.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        cause = %error,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Backoff::none())
    }

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run(&Classifier::default(), "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, CardpipeError>("done") }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let result = policy(3)
            .run(&Classifier::default(), "test", |attempt| async move {
                if attempt < 2 {
                    Err(CardpipeError::transport("connection refused"))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn exhausts_budget_on_retryable_errors() {
        let calls = AtomicU32::new(0);
        let failure = policy(2)
            .run(&Classifier::default(), "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CardpipeError::service(503, "overloaded")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.retryability, Retryability::Retryable);
        assert!(failure.to_string().contains("gave up after 3 attempts"));
    }

    #[tokio::test]
    async fn terminal_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let failure = policy(5)
            .run(&Classifier::default(), "test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CardpipeError::service(401, "unauthenticated")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.retryability, Retryability::Terminal);
        assert_eq!(failure.error.kind(), cardpipe_shared::ErrorKind::Service);
    }

    #[test]
    fn attempts_saturate() {
        assert_eq!(policy(0).attempts(), 1);
        assert_eq!(policy(u32::MAX).attempts(), u32::MAX);
    }
}
