//! Bounded polling with transient-error retries.
//!
//! Provider readiness and command completion are both observed by asking the
//! same question repeatedly. [`poll_until`] asks at a fixed interval until the
//! answer is ready or the attempt budget is spent. Errors the caller marks as
//! transient are retried with exponential backoff up to a separate budget.

use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Classifies errors that may succeed when retried.
pub trait Transient {
    /// Returns `true` when retrying the failed call may succeed.
    fn is_transient(&self) -> bool;
}

/// Outcome of a single poll check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Poll<T> {
    /// The awaited condition holds and produced a value.
    Ready(T),
    /// The condition does not hold yet.
    Pending,
}

/// Bounds and pacing for a polling loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay between consecutive pending checks.
    pub interval: Duration,
    /// Maximum number of checks before timing out.
    pub max_attempts: u32,
    /// Maximum number of consecutive transient failures tolerated.
    pub max_transient_retries: u32,
    /// Delay before the first transient retry; doubles on each further retry.
    pub initial_backoff: Duration,
    /// Ceiling applied to the backoff delay.
    pub max_backoff: Duration,
}

impl PollPolicy {
    /// Default number of consecutive transient retries.
    pub const DEFAULT_TRANSIENT_RETRIES: u32 = 5;

    /// Builds a policy with the given interval and attempt budget and the
    /// default transient retry settings.
    #[must_use]
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            max_transient_retries: Self::DEFAULT_TRANSIENT_RETRIES,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }

    /// Returns the policy with a different transient backoff schedule.
    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Returns the policy with a different transient retry budget.
    #[must_use]
    pub const fn with_transient_retries(mut self, retries: u32) -> Self {
        self.max_transient_retries = retries;
        self
    }

    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Errors returned by [`poll_until`] and [`retry_transient`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PollError<E> {
    /// Raised when every attempt reported the condition as pending.
    #[error("{label} did not complete after {attempts} attempts")]
    TimedOut {
        /// What was being awaited.
        label: String,
        /// Number of checks performed.
        attempts: u32,
    },
    /// Raised when transient failures exceed the retry budget.
    #[error("{label} failed after {retries} retries: {source}")]
    Exhausted {
        /// What was being awaited.
        label: String,
        /// Number of retries performed.
        retries: u32,
        /// Last transient error observed.
        #[source]
        source: E,
    },
    /// Raised when a check fails with a non-transient error.
    #[error("{label} failed: {source}")]
    Fatal {
        /// What was being awaited.
        label: String,
        /// Error reported by the check.
        #[source]
        source: E,
    },
}

impl<E> PollError<E> {
    /// Returns the wrapped provider error, if any.
    #[must_use]
    pub const fn source_error(&self) -> Option<&E> {
        match self {
            Self::TimedOut { .. } => None,
            Self::Exhausted { source, .. } | Self::Fatal { source, .. } => Some(source),
        }
    }
}

/// Calls `check` until it reports [`Poll::Ready`] or the policy's attempt
/// budget is spent.
///
/// Transient errors do not consume attempts; they are retried after an
/// exponential backoff until `max_transient_retries` consecutive failures have
/// been seen.
///
/// # Errors
///
/// Returns [`PollError::TimedOut`] when all attempts stay pending,
/// [`PollError::Exhausted`] when transient retries run out, and
/// [`PollError::Fatal`] for non-transient errors.
pub async fn poll_until<T, E, F>(
    policy: &PollPolicy,
    label: &str,
    mut check: F,
) -> Result<T, PollError<E>>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Result<Poll<T>, E>,
{
    let mut attempts = 0_u32;
    let mut retries = 0_u32;

    while attempts < policy.max_attempts {
        match check() {
            Ok(Poll::Ready(value)) => return Ok(value),
            Ok(Poll::Pending) => {
                retries = 0;
                attempts += 1;
                debug!(label, attempts, max = policy.max_attempts, "still pending");
                if attempts < policy.max_attempts {
                    sleep(policy.interval).await;
                }
            }
            Err(err) => retries = backoff_or_fail(policy, label, retries, err).await?,
        }
    }

    Err(PollError::TimedOut {
        label: label.to_owned(),
        attempts,
    })
}

/// Calls `op` once, retrying transient failures with exponential backoff.
///
/// # Errors
///
/// Returns [`PollError::Exhausted`] when transient retries run out and
/// [`PollError::Fatal`] for non-transient errors.
pub async fn retry_transient<T, E, F>(
    policy: &PollPolicy,
    label: &str,
    mut op: F,
) -> Result<T, PollError<E>>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Result<T, E>,
{
    let mut retries = 0_u32;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => retries = backoff_or_fail(policy, label, retries, err).await?,
        }
    }
}

async fn backoff_or_fail<E>(
    policy: &PollPolicy,
    label: &str,
    retries: u32,
    err: E,
) -> Result<u32, PollError<E>>
where
    E: Transient + std::fmt::Display,
{
    if !err.is_transient() {
        return Err(PollError::Fatal {
            label: label.to_owned(),
            source: err,
        });
    }
    if retries >= policy.max_transient_retries {
        return Err(PollError::Exhausted {
            label: label.to_owned(),
            retries,
            source: err,
        });
    }
    let next = retries + 1;
    let delay = policy.backoff(next);
    warn!(label, retry = next, ?delay, error = %err, "transient failure, retrying");
    sleep(delay).await;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::collections::VecDeque;
    use std::fmt;

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum FakeError {
        Busy,
        Broken,
    }

    impl fmt::Display for FakeError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Transient for FakeError {
        fn is_transient(&self) -> bool {
            matches!(self, Self::Busy)
        }
    }

    #[fixture]
    fn policy() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(1), 3)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
            .with_transient_retries(2)
    }

    fn scripted(
        steps: Vec<Result<Poll<u8>, FakeError>>,
    ) -> (impl FnMut() -> Result<Poll<u8>, FakeError>, std::rc::Rc<std::cell::Cell<u32>>) {
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = calls.clone();
        let mut queue: VecDeque<_> = steps.into();
        let check = move || {
            counter.set(counter.get() + 1);
            queue.pop_front().unwrap_or(Ok(Poll::Pending))
        };
        (check, calls)
    }

    #[rstest]
    #[tokio::test]
    async fn returns_first_ready_value(policy: PollPolicy) {
        let (check, calls) = scripted(vec![Ok(Poll::Pending), Ok(Poll::Ready(7))]);
        let value = poll_until(&policy, "ready", check).await.expect("ready");
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 2);
    }

    #[rstest]
    #[tokio::test]
    async fn times_out_after_max_attempts(policy: PollPolicy) {
        let (check, calls) = scripted(Vec::new());
        let err = poll_until(&policy, "never", check).await.expect_err("timeout");
        assert_eq!(
            err,
            PollError::TimedOut {
                label: String::from("never"),
                attempts: 3
            }
        );
        assert_eq!(calls.get(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn transient_errors_do_not_consume_attempts(policy: PollPolicy) {
        let (check, calls) = scripted(vec![
            Err(FakeError::Busy),
            Ok(Poll::Pending),
            Err(FakeError::Busy),
            Err(FakeError::Busy),
            Ok(Poll::Ready(1)),
        ]);
        let value = poll_until(&policy, "flaky", check).await.expect("ready");
        assert_eq!(value, 1);
        assert_eq!(calls.get(), 5);
    }

    #[rstest]
    #[tokio::test]
    async fn exhausted_retries_fail(policy: PollPolicy) {
        let (check, _) = scripted(vec![
            Err(FakeError::Busy),
            Err(FakeError::Busy),
            Err(FakeError::Busy),
        ]);
        let err = poll_until(&policy, "flaky", check).await.expect_err("exhausted");
        assert!(
            matches!(err, PollError::Exhausted { retries: 2, source: FakeError::Busy, .. }),
            "unexpected error: {err:?}"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn fatal_errors_stop_immediately(policy: PollPolicy) {
        let (check, calls) = scripted(vec![Err(FakeError::Broken)]);
        let err = poll_until(&policy, "broken", check).await.expect_err("fatal");
        assert_eq!(err.source_error(), Some(&FakeError::Broken));
        assert_eq!(calls.get(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn retry_transient_returns_value_after_retries(policy: PollPolicy) {
        let mut outcomes: VecDeque<Result<&str, FakeError>> =
            VecDeque::from([Err(FakeError::Busy), Ok("done")]);
        let value = retry_transient(&policy, "call", || {
            outcomes.pop_front().unwrap_or(Err(FakeError::Broken))
        })
        .await
        .expect("value");
        assert_eq!(value, "done");
    }

    #[rstest]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(3, 2)]
    fn backoff_doubles_up_to_ceiling(
        policy: PollPolicy,
        #[case] retry: u32,
        #[case] expected_ms: u64,
    ) {
        assert_eq!(policy.backoff(retry), Duration::from_millis(expected_ms));
    }
}
