//! Cancellation-aware retry with exponential backoff (spec.md §4.2).
//!
//! Pure library function, no global state: callers supply the closure, the
//! config, and a [`CancellationToken`]; everything else about how a
//! supplier's error gets classified as recoverable or not is up to the
//! caller via [`Attempt`].

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// How many times a supplier may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempts {
    Bounded(u32),
    Unbounded,
}

/// Backoff schedule configuration.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub attempts: Attempts,
    /// Exponent base `k`, must be `>= 1`.
    pub base_exp: u32,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub random: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: Attempts::Bounded(5),
            base_exp: 2,
            base_timeout: Duration::from_millis(100),
            max_timeout: Duration::from_secs(10),
            random: true,
        }
    }
}

/// A supplier's outcome: either a value, or an error it has classified as
/// recoverable (keep retrying) or not (stop immediately).
#[derive(Debug, Clone)]
pub enum Attempt<E> {
    Recoverable(E),
    NonRecoverable(E),
}

#[derive(Debug, Clone)]
pub enum RetryError<E> {
    Cancelled,
    MaxAttemptsReached(Vec<E>),
    NonRecoverable(E),
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "retry cancelled"),
            Self::MaxAttemptsReached(causes) => {
                write!(f, "max attempts reached after {} causes", causes.len())
            }
            Self::NonRecoverable(e) => write!(f, "non-recoverable error: {e}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

fn backoff_duration(config: &RetryConfig, attempt_index: u32) -> Duration {
    let exp = config.base_exp.max(1).saturating_pow(attempt_index);
    let scaled = config.base_timeout.saturating_mul(exp);
    let capped = scaled.min(config.max_timeout);

    if !config.random {
        return capped;
    }

    let mut rng = rand::thread_rng();
    if capped < config.max_timeout {
        capped.mul_f64(rng.gen_range(0.5..1.5))
    } else {
        capped.mul_f64(rng.gen_range(1.0..2.0))
    }
}

/// Retries `supplier` per `config`, honoring `cancel`.
///
/// `supplier` is re-invoked until it returns `Ok`, returns
/// `Err(Attempt::NonRecoverable(_))`, the attempt budget is exhausted, or
/// `cancel` fires.
pub async fn retry<T, E, F, Fut>(
    mut supplier: F,
    config: &RetryConfig,
    cancel: &CancellationToken,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let mut causes = Vec::new();
    let mut attempt_index: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match supplier().await {
            Ok(value) => return Ok(value),
            Err(Attempt::NonRecoverable(cause)) => return Err(RetryError::NonRecoverable(cause)),
            Err(Attempt::Recoverable(cause)) => {
                tracing::debug!(attempt = attempt_index, "retry.recoverable_failure");
                causes.push(cause);

                if let Attempts::Bounded(max) = config.attempts
                    && attempt_index + 1 >= max
                {
                    return Err(RetryError::MaxAttemptsReached(causes));
                }

                let wait = backoff_duration(config, attempt_index);
                attempt_index += 1;

                tokio::select! {
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(wait) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(attempts: Attempts) -> RetryConfig {
        RetryConfig {
            attempts,
            base_exp: 1,
            base_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_millis(2),
            random: false,
        }
    }

    #[tokio::test]
    async fn bounded_supplier_is_called_exactly_n_times_and_reports_n_causes() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), RetryError<u32>> = retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(Attempt::Recoverable(n)) }
            },
            &fast_config(Attempts::Bounded(4)),
            &cancel,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::MaxAttemptsReached(causes)) => assert_eq!(causes.len(), 4),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_recoverable_short_circuits_at_attempt_k() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result: Result<(), RetryError<&str>> = retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Attempt::Recoverable("retry me"))
                    } else {
                        Err(Attempt::NonRecoverable("fatal"))
                    }
                }
            },
            &fast_config(Attempts::Unbounded),
            &cancel,
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(RetryError::NonRecoverable("fatal"))));
    }

    #[tokio::test]
    async fn succeeds_eventually() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        let result = retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Attempt::Recoverable("not yet"))
                    } else {
                        Ok(42)
                    }
                }
            },
            &fast_config(Attempts::Bounded(10)),
            &cancel,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_the_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<()>> = retry(
            || async { Err(Attempt::Recoverable(())) },
            &fast_config(Attempts::Bounded(10)),
            &cancel,
        )
        .await;

        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
