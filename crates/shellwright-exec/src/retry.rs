//! Bounded dial retry
//!
//! Each dial stage is driven by a small state machine. [`DialState::next`]
//! is the whole transition table; [`dial_with_retry`] only performs the
//! attempts, the per-attempt timeout and the delay between attempts.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ExecError;
use crate::output::LogSink;
use crate::spec::{DialErrorLimit, HostSpec};

/// Default pause between two attempts of the same stage
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// State of one dial stage
#[derive(Debug)]
pub enum DialState<T> {
    /// Attempt number `attempt` (1-based) is next
    Attempting { attempt: u32 },
    /// An attempt connected
    Succeeded(T),
    /// The limit was exceeded or the failure cannot be retried
    RetryLimitExceeded { attempts: u32, cause: ExecError },
    /// The caller cancelled
    Cancelled,
}

/// What happened during one attempt
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Connected(T),
    Failed(ExecError),
    Cancelled,
}

impl<T> DialState<T> {
    /// Initial state
    #[must_use]
    pub fn start() -> Self {
        DialState::Attempting { attempt: 1 }
    }

    /// Apply an attempt outcome; terminal states are left unchanged
    #[must_use]
    pub fn next(self, outcome: AttemptOutcome<T>, limit: DialErrorLimit) -> Self {
        let DialState::Attempting { attempt } = self else {
            return self;
        };
        match outcome {
            AttemptOutcome::Connected(value) => DialState::Succeeded(value),
            AttemptOutcome::Cancelled => DialState::Cancelled,
            AttemptOutcome::Failed(cause) if limit.exceeded(attempt) || !cause.is_retryable() => {
                DialState::RetryLimitExceeded {
                    attempts: attempt,
                    cause,
                }
            }
            AttemptOutcome::Failed(_) => DialState::Attempting {
                attempt: attempt + 1,
            },
        }
    }

    /// Whether no further transition can happen
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DialState::Attempting { .. })
    }
}

/// Retry settings for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated
    pub limit: DialErrorLimit,
    /// Fixed pause between attempts
    pub delay: Duration,
    /// Bound on a single attempt
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Policy taken from a hop's limits
    #[must_use]
    pub fn for_host(host: &HostSpec, delay: Duration) -> Self {
        Self {
            limit: host.dial_error_limit,
            delay,
            attempt_timeout: host.dial_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: DialErrorLimit::default(),
            delay: DEFAULT_RETRY_DELAY,
            attempt_timeout: None,
        }
    }
}

/// Run `attempt` until it connects, the limit is exceeded or `cancel` fires
///
/// `attempt` receives the 1-based attempt number. Every failure that will be
/// retried is reported to `sink` as `"{stage} {attempt}/{limit} failed: retrying"`.
///
/// # Errors
/// Returns `ExecError::DialExhausted` carrying the attempt count and last
/// cause, or `ExecError::Cancelled`
pub async fn dial_with_retry<T, F, Fut>(
    stage: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    sink: &dyn LogSink,
    mut attempt: F,
) -> Result<T, ExecError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ExecError>>,
{
    let mut state = DialState::start();
    loop {
        state = match state {
            DialState::Attempting { attempt: n } => {
                let outcome = tokio::select! {
                    biased;
                    () = cancel.cancelled() => AttemptOutcome::Cancelled,
                    result = bounded(policy.attempt_timeout, attempt(n)) => match result {
                        Ok(value) => AttemptOutcome::Connected(value),
                        Err(e) => {
                            debug!(stage, attempt = n, error = %e, "dial attempt failed");
                            AttemptOutcome::Failed(e)
                        }
                    },
                };

                let next = DialState::Attempting { attempt: n }.next(outcome, policy.limit);
                if next.is_terminal() {
                    next
                } else {
                    sink.status(&format!("{stage} {n}/{} failed: retrying", policy.limit));
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => DialState::Cancelled,
                        () = tokio::time::sleep(policy.delay) => next,
                    }
                }
            }
            DialState::Succeeded(value) => return Ok(value),
            DialState::RetryLimitExceeded { attempts, cause } => {
                warn!(stage, attempts, error = %cause, "giving up");
                return Err(ExecError::DialExhausted {
                    stage: stage.to_string(),
                    attempts,
                    cause: cause.to_string(),
                });
            }
            DialState::Cancelled => return Err(ExecError::Cancelled),
        };
    }
}

async fn bounded<T, Fut>(limit: Option<Duration>, fut: Fut) -> Result<T, ExecError>
where
    Fut: Future<Output = Result<T, ExecError>>,
{
    match limit {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ExecError::Timeout { timeout })?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::output::tests::RecordingSink;

    fn policy(limit: DialErrorLimit) -> RetryPolicy {
        RetryPolicy {
            limit,
            delay: Duration::from_millis(1),
            attempt_timeout: None,
        }
    }

    fn refused() -> ExecError {
        ExecError::ConnectionFailed("connection refused".to_string())
    }

    #[test]
    fn test_transition_table() {
        let limit = DialErrorLimit::Limited(1);

        let s = DialState::<()>::start().next(AttemptOutcome::Failed(refused()), limit);
        assert!(matches!(s, DialState::Attempting { attempt: 2 }));

        let s = s.next(AttemptOutcome::Failed(refused()), limit);
        assert!(matches!(s, DialState::RetryLimitExceeded { attempts: 2, .. }));

        let s = DialState::start().next(AttemptOutcome::Connected(7), limit);
        assert!(matches!(s, DialState::Succeeded(7)));

        let s = DialState::<()>::start().next(AttemptOutcome::Cancelled, limit);
        assert!(matches!(s, DialState::Cancelled));

        // terminal states absorb further outcomes
        let s = DialState::<()>::Cancelled.next(AttemptOutcome::Connected(()), limit);
        assert!(matches!(s, DialState::Cancelled));
    }

    #[test]
    fn test_non_retryable_failure_stops() {
        let s = DialState::<()>::start().next(
            AttemptOutcome::Failed(ExecError::InvalidInput("bad".to_string())),
            DialErrorLimit::Unlimited,
        );
        assert!(matches!(s, DialState::RetryLimitExceeded { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_limit_n_means_n_plus_one_attempts() {
        let sink = RecordingSink::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = dial_with_retry(
            "Dial",
            &policy(DialErrorLimit::Limited(3)),
            &CancellationToken::new(),
            &sink,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(refused()) }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let err = result.unwrap_err();
        assert!(err.to_string().contains("after 4 failed attempts"), "{err}");
        assert!(err.to_string().contains("connection refused"));

        let statuses = sink.statuses.lock().unwrap().clone();
        assert_eq!(
            statuses,
            vec![
                "Dial 1/3 failed: retrying",
                "Dial 2/3 failed: retrying",
                "Dial 3/3 failed: retrying",
            ]
        );
    }

    #[tokio::test]
    async fn test_limit_zero_tries_once() {
        let sink = RecordingSink::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = dial_with_retry(
            "Dial",
            &policy(DialErrorLimit::Limited(0)),
            &CancellationToken::new(),
            &sink,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(refused()) }
            },
        )
        .await;
        assert!(matches!(result, Err(ExecError::DialExhausted { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let sink = RecordingSink::default();
        let value = dial_with_retry(
            "Dial proxy",
            &policy(DialErrorLimit::Limited(5)),
            &CancellationToken::new(),
            &sink,
            |n| async move { if n < 3 { Err(refused()) } else { Ok(n) } },
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(sink.statuses.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unlimited_stops_on_cancel() {
        let sink = RecordingSink::default();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = dial_with_retry(
            "Dial",
            &policy(DialErrorLimit::Unlimited),
            &cancel,
            &sink,
            |_| async { Err(refused()) },
        )
        .await;

        assert!(matches!(result, Err(ExecError::Cancelled)));
        let statuses = sink.statuses.lock().unwrap();
        assert!(statuses.iter().all(|s| s.contains("/inf failed")));
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let sink = RecordingSink::default();
        let policy = RetryPolicy {
            attempt_timeout: Some(Duration::from_millis(20)),
            ..policy(DialErrorLimit::Limited(1))
        };
        let result: Result<(), _> = dial_with_retry(
            "Dial",
            &policy,
            &CancellationToken::new(),
            &sink,
            |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ExecError::DialExhausted { attempts: 2, .. }));
        assert!(err.to_string().contains("timed out"));
    }
}
