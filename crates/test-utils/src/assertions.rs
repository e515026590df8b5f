//! Polling assertions for async tests.
//!
//! Connection state, ready counts and resolver membership all change on
//! background tasks; these helpers wait for a condition instead of sleeping.

use std::{future::Future, time::Duration};

use tokio::time::{Instant, sleep};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a condition until it returns true or the timeout expires.
///
/// Returns `true` if the condition held before the deadline. The condition
/// is evaluated one final time after the deadline passes.
///
/// # Example
///
/// ```no_run
/// use std::sync::atomic::{AtomicI64, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use nsq_test_utils::assert_eventually;
///
/// #[tokio::test]
/// async fn waits_for_ready_count() {
///     let ready = Arc::new(AtomicI64::new(0));
///     let writer = ready.clone();
///
///     tokio::spawn(async move {
///         tokio::time::sleep(Duration::from_millis(50)).await;
///         writer.store(6, Ordering::SeqCst);
///     });
///
///     let reached = assert_eventually(Duration::from_millis(200), || {
///         ready.load(Ordering::SeqCst) == 6
///     }).await;
///
///     assert!(reached, "ready count should reach 6");
/// }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    condition()
}

/// Like [`assert_eventually`], for conditions that must await.
pub async fn assert_eventually_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        sleep(DEFAULT_POLL_INTERVAL).await;
    }

    condition().await
}
