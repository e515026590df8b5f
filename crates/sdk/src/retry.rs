//! Retry logic with exponential backoff.
//!
//! Topology queries against lookupd nodes go through
//! [`with_retry_cancellable`]; every attempt and every backoff sleep races the
//! owner's [`CancellationToken`] so a closing consumer never waits on a slow
//! directory node.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    config::RetryPolicy,
    error::{Result, SdkError},
};

/// Execute an async operation with retry and cancellation support.
///
/// The operation is retried according to `policy` while it fails with a
/// retryable error (see [`SdkError::is_retryable`]).
///
/// # Retry Strategy
///
/// - **Exponential backoff**: `initial_backoff * multiplier^(attempt-1)`
/// - **Jitter**: ±`jitter` randomness applied to each sleep
/// - **Cap**: backoff capped at `max_backoff`
/// - **Termination**: after `max_attempts` failed attempts the last error is
///   wrapped in [`SdkError::RetryExhausted`] with the per-attempt history
///
/// # Cancellation Semantics
///
/// - Token already cancelled at call time: `Cancelled` without calling `operation`.
/// - Token cancelled during an attempt: the attempt is dropped, `Cancelled` returned.
/// - Token cancelled during a backoff sleep: the sleep is cut short, `Cancelled` returned.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> nsq_sdk::Result<()> {
/// use nsq_sdk::{RetryPolicy, SdkError, with_retry_cancellable};
/// use tokio_util::sync::CancellationToken;
///
/// let policy = RetryPolicy::default();
/// let token = CancellationToken::new();
///
/// let value = with_retry_cancellable(&policy, &token, || async {
///     Ok::<_, SdkError>("success")
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_retry_cancellable<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if token.is_cancelled() {
        return Err(SdkError::Cancelled);
    }

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 0;
    let mut backoff_duration = policy.initial_backoff;
    let mut attempt_history: Vec<(u32, String)> = Vec::new();

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            () = token.cancelled() => return Err(SdkError::Cancelled),
            result = operation() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        attempt_history.push((attempt, err.to_string()));

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(SdkError::RetryExhausted {
                attempts: attempt,
                last_error: err.to_string(),
                attempt_history,
            });
        }

        let jittered = apply_jitter(backoff_duration, policy.jitter);

        debug!(
            attempt,
            backoff_ms = u64::try_from(jittered.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "retrying after backoff"
        );

        tokio::select! {
            biased;
            () = token.cancelled() => return Err(SdkError::Cancelled),
            () = tokio::time::sleep(jittered) => {}
        }

        backoff_duration = next_backoff(backoff_duration, policy);
    }
}

/// Advances `current` by the policy multiplier, capped at `max_backoff`.
fn next_backoff(current: Duration, policy: &RetryPolicy) -> Duration {
    let scaled = current.as_nanos() as f64 * policy.multiplier.max(1.0);
    let scaled = Duration::from_nanos(scaled.min(u64::MAX as f64) as u64);
    scaled.min(policy.max_backoff)
}

/// Apply jitter to a duration.
///
/// Jitter adds randomness in the range `[dur * (1 - factor), dur * (1 + factor)]`.
fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || dur.is_zero() {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let mut rng = rand::rng();

    let base_nanos = dur.as_nanos() as f64;
    let min_nanos = base_nanos * (1.0 - factor);
    let max_nanos = base_nanos * (1.0 + factor);

    let jittered_nanos = rng.random_range(min_nanos..=max_nanos);
    Duration::from_nanos(jittered_nanos as u64)
}


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod proptest_tests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Jittered duration stays within `[base * (1 - f), base * (1 + f)]`.
        #[test]
        fn prop_jitter_within_bounds(base_ms in 1u64..10_000, factor in 0.0f64..=1.0) {
            let dur = Duration::from_millis(base_ms);
            let jittered = apply_jitter(dur, factor);

            let nanos = dur.as_nanos() as f64;
            let max_allowed = Duration::from_nanos((nanos * (1.0 + factor)).ceil() as u64);
            let min_allowed = Duration::from_nanos((nanos * (1.0 - factor)).floor() as u64);

            prop_assert!(jittered <= max_allowed, "{jittered:?} > {max_allowed:?}");
            prop_assert!(jittered >= min_allowed, "{jittered:?} < {min_allowed:?}");
        }

        /// Non-positive factors leave the duration untouched.
        #[test]
        fn prop_non_positive_jitter_is_identity(base_ms in 1u64..10_000, factor in -10.0f64..=0.0) {
            let dur = Duration::from_millis(base_ms);
            prop_assert_eq!(apply_jitter(dur, factor), dur);
        }

        /// Backoff never exceeds `max_backoff`, however many times it advances.
        #[test]
        fn prop_backoff_bounded_by_max(
            initial_ms in 1u64..1000,
            max_ms in 1u64..10_000,
            multiplier in 1.0f64..10.0,
            steps in 0usize..40,
        ) {
            let policy = RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
                multiplier,
                jitter: 0.0,
            };
            let mut backoff = policy.initial_backoff.min(policy.max_backoff);
            for _ in 0..steps {
                backoff = next_backoff(backoff, &policy);
                prop_assert!(backoff <= policy.max_backoff);
            }
        }
    }
}
