//! Generic async retry loop with exponential backoff and jitter (§4.4).
//!
//! Mirrors the shape of the teacher's `tower-resilience-retry` layer
//! (`RetryLayer::builder().max_attempts(..).exponential_backoff(..)`) but as
//! a free function over an async work factory instead of a `tower::Service`
//! wrapper — the orchestrator needs to interleave breaker admission and WAL
//! writes between attempts, which a `Layer` can't see into.

use std::future::Future;
use std::time::Duration;

use crate::error::BridgeError;

/// Policy controlling a single [`retry_with_backoff`] call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Must be >= 1.
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Builds a policy from a [`Config`](crate::config::Config)'s standard
    /// (non-critical) retry fields.
    pub fn standard(config: &crate::config::Config) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            initial_delay: config.retry_initial_delay,
            max_delay: config.retry_max_delay,
            exponential_base: config.retry_exponential_base,
            jitter: config.retry_jitter,
        }
    }

    /// Builds a policy from a [`Config`](crate::config::Config)'s critical
    /// (order-submission) retry fields.
    pub fn critical(config: &crate::config::Config) -> Self {
        Self {
            max_attempts: config.critical_retry_max_attempts,
            initial_delay: config.critical_retry_initial_delay,
            max_delay: config.critical_retry_max_delay,
            exponential_base: config.retry_exponential_base,
            jitter: config.retry_jitter,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        let bounded = scaled.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            bounded * rand::rng().random_range(0.5..=1.5)
        } else {
            bounded
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

use rand::Rng;

/// Optional hooks invoked around each attempt (§4.4).
pub trait RetryHooks<T> {
    /// Called before sleeping between attempts, with the zero-based attempt
    /// number that just failed and the delay about to be slept.
    fn before_retry(&mut self, _attempt: usize, _delay: Duration) {}
    /// Called once the work factory returns `Ok`.
    fn on_success(&mut self, _attempt: usize, _value: &T) {}
    /// Called every time the work factory returns `Err`, including the last.
    fn on_failure(&mut self, _attempt: usize, _error: &BridgeError) {}
    /// Returns `false` to stop retrying even though attempts remain.
    fn should_retry(&mut self, _attempt: usize, _error: &BridgeError) -> bool {
        true
    }
}

/// A [`RetryHooks`] that does nothing; the default for callers with no
/// observability needs.
pub struct NoopHooks;
impl<T> RetryHooks<T> for NoopHooks {}

/// Runs `work` up to `policy.max_attempts` times, sleeping
/// `policy.delay_for(attempt)` between failures, subject to `hooks`.
///
/// Returns `Err(BridgeError::MaxRetries)` wrapping the last error once
/// attempts are exhausted or `hooks.should_retry` vetoes a retry.
///
/// # Panics
///
/// Does not panic; instead returns `Err(BridgeError::Config(..))` if
/// `policy.max_attempts` is 0, mirroring the teacher's `ValueError` for a
/// non-positive attempt count.
pub async fn retry_with_backoff<T, F, Fut, H>(
    policy: &RetryPolicy,
    hooks: &mut H,
    mut work: F,
) -> Result<T, BridgeError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
    H: RetryHooks<T>,
{
    if policy.max_attempts < 1 {
        return Err(BridgeError::Config(
            "max_attempts must be >= 1".to_string(),
        ));
    }

    let mut last_err: Option<BridgeError> = None;
    for attempt in 0..policy.max_attempts {
        match work(attempt).await {
            Ok(value) => {
                hooks.on_success(attempt, &value);
                return Ok(value);
            }
            Err(err) => {
                hooks.on_failure(attempt, &err);
                let is_last = attempt + 1 == policy.max_attempts;
                if is_last || !hooks.should_retry(attempt, &err) {
                    last_err = Some(err);
                    break;
                }
                let delay = policy.delay_for(attempt as u32);
                hooks.before_retry(attempt, delay);
                tokio::time::sleep(delay).await;
                last_err = Some(err);
            }
        }
    }

    Err(BridgeError::MaxRetries {
        attempts: policy.max_attempts,
        source: Box::new(last_err.expect("loop always records an error before exiting")),
    })
}

/// Retries `connect` with the same backoff shape until it succeeds or the
/// policy is exhausted — used by [`crate::connection::ConnectionManager`]
/// when `enable_auto_reconnect` is set.
pub async fn reconnect_with_backoff<F, Fut>(
    policy: &RetryPolicy,
    connect: F,
) -> Result<(), BridgeError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<(), BridgeError>>,
{
    retry_with_backoff(policy, &mut NoopHooks, connect).await
}

/// Runs `fut` with a timeout, mapping elapsed-deadline into
/// [`BridgeError::Transport`] with a `DeadlineExceeded` status so the
/// classifier treats it like any other transport-level timeout.
pub async fn execute_with_timeout<T, Fut>(
    timeout: Duration,
    fut: Fut,
) -> Result<T, BridgeError>
where
    Fut: Future<Output = Result<T, BridgeError>>,
{
    if timeout.is_zero() {
        return Err(BridgeError::Config("timeout must be > 0".to_string()));
    }
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::Transport(tonic::Status::deadline_exceeded(
            "operation timed out",
        ))),
    }
}

/// Like [`execute_with_timeout`], but guarantees the work is actually
/// cancelled rather than merely abandoned: the work runs as its own task,
/// and a deadline miss aborts that task and awaits its join before
/// returning, so a caller never races a lingering background RPC against
/// whatever it does next (§4.4).
///
/// Returns `(None, true)` on a genuine timeout, `(Some(result), false)` if
/// the work finished before the deadline — including the race where it
/// finishes exactly as the deadline fires, since the abort only takes
/// effect if the task hadn't already completed.
pub async fn execute_with_timeout_and_cancel<T, Fut>(
    name: &str,
    timeout: Duration,
    fut: Fut,
) -> (Option<Result<T, BridgeError>>, bool)
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, BridgeError>> + Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    tokio::select! {
        joined = &mut handle => {
            match joined {
                Ok(result) => (Some(result), false),
                Err(_) => (None, false),
            }
        }
        _ = tokio::time::sleep(timeout) => {
            handle.abort();
            match handle.await {
                Ok(result) => (Some(result), false),
                Err(join_err) => {
                    tracing::warn!(operation = name, ?timeout, cancelled = join_err.is_cancelled(), "operation timed out and was cancelled");
                    (None, true)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_try_without_sleeping() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = retry_with_backoff(&policy(3), &mut NoopHooks, move |_attempt| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BridgeError>(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success_within_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = retry_with_backoff(&policy(5), &mut NoopHooks, move |attempt| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(BridgeError::Transport(tonic::Status::unavailable("down")))
                } else {
                    Ok(99)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_wraps_last_error() {
        let result: Result<i32, _> = retry_with_backoff(&policy(3), &mut NoopHooks, |_attempt| async {
            Err(BridgeError::Transport(tonic::Status::unavailable("down")))
        })
        .await;
        match result {
            Err(BridgeError::MaxRetries { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected MaxRetries, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_max_attempts_is_a_config_error() {
        let result: Result<i32, _> =
            retry_with_backoff(&policy(0), &mut NoopHooks, |_attempt| async { Ok(1) }).await;
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    struct Veto;
    impl<T> RetryHooks<T> for Veto {
        fn should_retry(&mut self, _attempt: usize, _error: &BridgeError) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn should_retry_hook_can_veto_remaining_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result: Result<i32, _> = retry_with_backoff(&policy(5), &mut Veto, move |_attempt| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BridgeError::Transport(tonic::Status::unavailable("down")))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_timeout_is_a_config_error() {
        let result = execute_with_timeout(Duration::ZERO, async { Ok::<_, BridgeError>(1) }).await;
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn timeout_elapses_to_a_transport_deadline_error() {
        let result = execute_with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, BridgeError>(1)
        })
        .await;
        assert!(matches!(result, Err(BridgeError::Transport(_))));
    }

    #[tokio::test]
    async fn timeout_and_cancel_returns_result_when_work_finishes_in_time() {
        let (result, timed_out) =
            execute_with_timeout_and_cancel("quick", Duration::from_secs(5), async {
                Ok::<_, BridgeError>(7)
            })
            .await;
        assert!(!timed_out);
        assert_eq!(result.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn timeout_and_cancel_aborts_the_task_on_deadline_miss() {
        let ran_to_completion = Arc::new(AtomicUsize::new(0));
        let flag = ran_to_completion.clone();
        let (result, timed_out) =
            execute_with_timeout_and_cancel("slow", Duration::from_millis(5), async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BridgeError>(1)
            })
            .await;
        assert!(timed_out);
        assert!(result.is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran_to_completion.load(Ordering::SeqCst), 0);
    }
}
