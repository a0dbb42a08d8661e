//! Transaction orchestrator: idempotent, verify-before-retry critical order
//! submission (§4.7).
//!
//! This is the core safety component the rest of the crate exists to
//! support: every order-send style RPC moves through
//! `log_intent → breaker-gated send → classify → verify-or-retry` so that an
//! ambiguous transport failure or retcode never turns into a silent
//! duplicate order and never silently gives up on one that actually
//! executed.

use std::future::Future;
use std::pin::Pin;

use tracing::{error, warn};

use crate::circuit::CircuitBreaker;
use crate::classify::{classify_retcode, outcome_for, ErrorClassification, TransactionOutcome};
use crate::error::BridgeError;
use crate::request_id::{embed_request_id, generate_request_id};
use crate::retry::RetryPolicy;
use crate::wal::Wal;

/// A single attempt's result: the terminal's retcode plus whatever payload
/// the caller needs back (deal id, order id, ...), opaque to this module.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub retcode: i32,
    pub payload: serde_json::Value,
}

type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<OrderResult, BridgeError>> + Send + 'a>>;
type VerifyFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<OrderResult>, BridgeError>> + Send + 'a>>;
type HealthFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Outcome of a fully-resolved transaction, including the request id used so
/// callers can cross-reference the WAL or logs.
#[derive(Debug, Clone)]
pub struct TransactionResult {
    pub request_id: String,
    pub outcome: TransactionOutcome,
    pub result: Option<OrderResult>,
}

/// Orchestrates one critical order submission end to end.
pub struct TransactionOrchestrator {
    breaker: std::sync::Arc<CircuitBreaker>,
    wal: std::sync::Arc<Wal>,
    retry_policy: RetryPolicy,
}

impl TransactionOrchestrator {
    pub fn new(
        breaker: std::sync::Arc<CircuitBreaker>,
        wal: std::sync::Arc<Wal>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            breaker,
            wal,
            retry_policy,
        }
    }

    /// Executes `operation` with idempotency and verify-before-retry safety.
    ///
    /// `send` performs the actual RPC using the comment with the embedded
    /// request id already mixed in. `verify` re-queries the terminal (by
    /// request id) for whether an order bearing that id actually executed;
    /// it is only ever called when the true state is ambiguous, never on a
    /// definitively successful or definitively permanent result.
    pub async fn execute<'a, S, V, H>(
        &'a self,
        operation: &str,
        comment: &str,
        payload: &str,
        send: S,
        verify: V,
        health_check: H,
    ) -> Result<TransactionResult, BridgeError>
    where
        S: for<'b> Fn(&'b str) -> SendFuture<'b> + 'a,
        V: for<'b> Fn(&'b str) -> VerifyFuture<'b> + 'a,
        H: for<'b> Fn() -> HealthFuture<'b> + 'a,
    {
        self.execute_with_id(
            generate_request_id(),
            operation,
            comment,
            payload,
            send,
            verify,
            health_check,
        )
        .await
    }

    /// Same contract as [`Self::execute`], but with the request id supplied
    /// by the caller instead of generated here — lets `order_send_async`/
    /// `order_send_batch` hand the id back to their caller before the order
    /// has actually resolved.
    ///
    /// `health_check` is a quick remote liveness probe (§4.7), consulted only
    /// when a transport error's own verify pass comes back empty: a terminal
    /// we can't even ping is not safe to blind-retry, since the attempt that
    /// just failed may have executed anyway.
    pub async fn execute_with_id<'a, S, V, H>(
        &'a self,
        request_id: String,
        operation: &str,
        comment: &str,
        payload: &str,
        send: S,
        verify: V,
        health_check: H,
    ) -> Result<TransactionResult, BridgeError>
    where
        S: for<'b> Fn(&'b str) -> SendFuture<'b> + 'a,
        V: for<'b> Fn(&'b str) -> VerifyFuture<'b> + 'a,
        H: for<'b> Fn() -> HealthFuture<'b> + 'a,
    {
        let embedded_comment = embed_request_id(&request_id, comment);
        self.wal.log_intent(&request_id, operation, payload).await?;

        let mut last_err: Option<BridgeError> = None;

        for attempt in 0..self.retry_policy.max_attempts {
            self.breaker.gate()?;
            self.wal.mark_sent(&request_id).await?;

            match send(&embedded_comment).await {
                Ok(result) => {
                    self.breaker.record_success();
                    let classification = classify_retcode(result.retcode);
                    let outcome = outcome_for(classification);

                    match classification {
                        ErrorClassification::Success | ErrorClassification::Partial => {
                            self.wal.mark_verified(&request_id, Some(result.retcode)).await?;
                            return Ok(TransactionResult {
                                request_id,
                                outcome,
                                result: Some(result),
                            });
                        }
                        ErrorClassification::Retryable => {
                            last_err = Some(BridgeError::Permanent {
                                retcode: Some(result.retcode),
                                message: "retryable retcode, order not executed".to_string(),
                            });
                        }
                        ErrorClassification::VerifyRequired
                        | ErrorClassification::Conditional
                        | ErrorClassification::Unknown => {
                            warn!(
                                event = "TX_VERIFY_REQUIRED",
                                request_id = %request_id,
                                retcode = result.retcode,
                                "ambiguous retcode on order submission, verifying before retry"
                            );
                            if let Some(outcome_result) = self
                                .resolve_via_verify(&request_id, &verify, Some(result.retcode))
                                .await?
                            {
                                return Ok(outcome_result);
                            }
                            // §4.7 step 4.h: no matching executed deal means we
                            // stop here. Re-sending now would risk a second
                            // order_send against a request that may already
                            // have executed (scenario S4) — never blind-retry
                            // on an unverified ambiguous result.
                            self.wal.mark_failed(&request_id, Some(result.retcode)).await?;
                            return Err(BridgeError::Permanent {
                                retcode: Some(result.retcode),
                                message: "ambiguous retcode, verification found no execution"
                                    .to_string(),
                            });
                        }
                        ErrorClassification::Permanent => {
                            self.wal.mark_failed(&request_id, Some(result.retcode)).await?;
                            return Err(BridgeError::Permanent {
                                retcode: Some(result.retcode),
                                message: "terminal returned a permanent failure retcode"
                                    .to_string(),
                            });
                        }
                    }
                }
                Err(err) => {
                    self.breaker.record_failure();
                    if err.is_retryable() {
                        warn!(
                            request_id = %request_id,
                            attempt,
                            error = %err,
                            "ambiguous transport failure during order submission, verifying before retry"
                        );
                        if let Some(outcome_result) =
                            self.resolve_via_verify(&request_id, &verify, None).await?
                        {
                            return Ok(outcome_result);
                        }
                        // Verification came back empty. A terminal we can't
                        // even ping is unsafe to blind-retry against — the
                        // attempt that just failed may have executed anyway.
                        if !health_check().await {
                            self.wal.mark_failed(&request_id, None).await?;
                            return Err(BridgeError::Permanent {
                                retcode: None,
                                message: "transport failure and terminal unreachable, \
                                          verification inconclusive"
                                    .to_string(),
                            });
                        }
                        last_err = Some(err);
                    } else {
                        self.wal.mark_failed(&request_id, None).await?;
                        return Err(err);
                    }
                }
            }

            let is_last = attempt + 1 == self.retry_policy.max_attempts;
            if is_last {
                break;
            }
            let delay = self.retry_policy.delay_for(attempt as u32);
            tokio::time::sleep(delay).await;
        }

        self.wal.mark_failed(&request_id, None).await?;
        let source = Box::new(last_err.unwrap_or(BridgeError::Operation(
            "exhausted retries with no recorded error".to_string(),
        )));
        error!(
            request_id = %request_id,
            attempts = self.retry_policy.max_attempts,
            retcode = ?source.retcode(),
            "critical order submission exhausted all retry attempts"
        );
        Err(BridgeError::MaxRetries {
            attempts: self.retry_policy.max_attempts,
            source,
        })
    }

    /// Re-queries the terminal for `request_id`. If found, the order's true
    /// outcome is used and the WAL entry is closed out as VERIFIED; if not
    /// found, returns `Ok(None)` so the caller's retry loop may safely try
    /// again — the order is confirmed not to have executed.
    async fn resolve_via_verify<V>(
        &self,
        request_id: &str,
        verify: &V,
        fallback_retcode: Option<i32>,
    ) -> Result<Option<TransactionResult>, BridgeError>
    where
        V: for<'b> Fn(&'b str) -> VerifyFuture<'b>,
    {
        match verify(request_id).await? {
            Some(found) => {
                self.wal.mark_verified(request_id, Some(found.retcode)).await?;
                let outcome = outcome_for(classify_retcode(found.retcode));
                Ok(Some(TransactionResult {
                    request_id: request_id.to_string(),
                    outcome,
                    result: Some(found),
                }))
            }
            None => {
                let _ = fallback_retcode;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: false,
        }
    }

    async fn orchestrator(max_attempts: usize) -> TransactionOrchestrator {
        let breaker = Arc::new(CircuitBreaker::new(100, Duration::from_secs(30), 1));
        let file = NamedTempFile::new().unwrap();
        let wal = Arc::new(Wal::open(file.path().to_path_buf(), 7).await.unwrap());
        TransactionOrchestrator::new(breaker, wal, policy(max_attempts))
    }

    fn always_healthy() -> impl for<'b> Fn() -> HealthFuture<'b> {
        || Box::pin(async { true })
    }

    fn always_unhealthy() -> impl for<'b> Fn() -> HealthFuture<'b> {
        || Box::pin(async { false })
    }

    #[tokio::test]
    async fn happy_path_success_retcode_resolves_immediately() {
        let orch = orchestrator(3).await;
        let result = orch
            .execute(
                "order_send",
                "test",
                "{}",
                |_comment| Box::pin(async { Ok(OrderResult { retcode: 10009, payload: serde_json::Value::Null }) }),
                |_id| Box::pin(async { Ok(None) }),
                always_healthy(),
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, TransactionOutcome::Success);
    }

    #[tokio::test]
    async fn permanent_retcode_fails_without_retry() {
        let orch = orchestrator(3).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = orch
            .execute(
                "order_send",
                "test",
                "{}",
                move |_comment| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Ok(OrderResult { retcode: 10006, payload: serde_json::Value::Null }) })
                },
                |_id| Box::pin(async { Ok(None) }),
                always_healthy(),
            )
            .await;
        assert!(matches!(result, Err(BridgeError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ambiguous_timeout_verifies_before_declaring_success() {
        let orch = orchestrator(3).await;
        let result = orch
            .execute(
                "order_send",
                "test",
                "{}",
                |_comment| {
                    Box::pin(async {
                        Err(BridgeError::Transport(tonic::Status::deadline_exceeded("timeout")))
                    })
                },
                |_id| {
                    Box::pin(async {
                        Ok(Some(OrderResult { retcode: 10009, payload: serde_json::Value::Null }))
                    })
                },
                always_healthy(),
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, TransactionOutcome::Success);
    }

    /// §4.7 step 4.h: an ambiguous *retcode* (VERIFY_REQUIRED/CONDITIONAL/
    /// UNKNOWN) whose verify pass finds nothing must fail permanently on the
    /// spot — never fire a second `send`. This is the exact case scenario S4
    /// forbids ("under no path does a second order_send RPC fire").
    #[tokio::test]
    async fn ambiguous_retcode_with_no_verification_evidence_fails_without_a_second_send() {
        let orch = orchestrator(3).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = orch
            .execute(
                "order_send",
                "test",
                "{}",
                move |_comment| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    // 10012 = VERIFY_REQUIRED-classified retcode.
                    Box::pin(async { Ok(OrderResult { retcode: 10012, payload: serde_json::Value::Null }) })
                },
                |_id| Box::pin(async { Ok(None) }),
                always_healthy(),
            )
            .await;
        assert!(matches!(result, Err(BridgeError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    /// A transport error whose verify pass also comes back empty is only
    /// safe to retry while the terminal is reachable (§4.7's exception
    /// handling: "if health_check fails, we must not retry").
    #[tokio::test]
    async fn ambiguous_transport_failure_retries_while_terminal_stays_healthy() {
        let orch = orchestrator(2).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = orch
            .execute(
                "order_send",
                "test",
                "{}",
                move |_comment| {
                    let calls = calls2.clone();
                    Box::pin(async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            Err(BridgeError::Transport(tonic::Status::deadline_exceeded("timeout")))
                        } else {
                            Ok(OrderResult { retcode: 10009, payload: serde_json::Value::Null })
                        }
                    })
                },
                |_id| Box::pin(async { Ok(None) }),
                always_healthy(),
            )
            .await
            .unwrap();
        assert_eq!(result.outcome, TransactionOutcome::Success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Same ambiguous transport failure, but the terminal is unreachable: no
    /// retry is safe, so the orchestrator must fail permanently after a
    /// single send.
    #[tokio::test]
    async fn ambiguous_transport_failure_does_not_retry_against_an_unhealthy_terminal() {
        let orch = orchestrator(3).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = orch
            .execute(
                "order_send",
                "test",
                "{}",
                move |_comment| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {
                        Err(BridgeError::Transport(tonic::Status::deadline_exceeded("timeout")))
                    })
                },
                |_id| Box::pin(async { Ok(None) }),
                always_unhealthy(),
            )
            .await;
        assert!(matches!(result, Err(BridgeError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_open_aborts_before_sending() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(30), 1));
        breaker.record_failure();
        let file = NamedTempFile::new().unwrap();
        let wal = Arc::new(Wal::open(file.path().to_path_buf(), 7).await.unwrap());
        let orch = TransactionOrchestrator::new(breaker, wal, policy(3));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = orch
            .execute(
                "order_send",
                "test",
                "{}",
                move |_comment| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Ok(OrderResult { retcode: 10009, payload: serde_json::Value::Null }) })
                },
                |_id| Box::pin(async { Ok(None) }),
                always_healthy(),
            )
            .await;
        assert!(matches!(result, Err(BridgeError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
