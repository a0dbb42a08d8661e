//! The error classifier (§4.2): a pure function from (transport status,
//! terminal retcode, operation name) to a disposition tag.
//!
//! Encoded as sets, not scattered if/else, per the design's explicit
//! requirement — the disjointness and coverage of these sets is itself a
//! safety invariant, asserted by the property tests at the bottom of this
//! module and by `tests/classify.rs`.

use crate::error::BridgeError;

/// Disposition of a terminal retcode; internal to the classifier/orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    Success,
    Partial,
    Retryable,
    VerifyRequired,
    Conditional,
    Permanent,
    Unknown,
}

/// Public-facing simplification of [`ErrorClassification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Success,
    Partial,
    Retry,
    VerifyRequired,
    PermanentFailure,
}

/// How important an operation is for safety/correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum OperationCriticality {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

/// `SUCCESS_SET` (§4.2): 10008 PLACED, 10009 DONE.
pub const SUCCESS_SET: &[i32] = &[10008, 10009];
/// `PARTIAL_SET`: 10010 DONE_PARTIAL.
pub const PARTIAL_SET: &[i32] = &[10010];
/// `VERIFY_REQUIRED_SET`: 10012 TIMEOUT, 10031 CONNECTION. Never retryable.
pub const VERIFY_REQUIRED_SET: &[i32] = &[10012, 10031];
/// `RETRYABLE_SET`: guaranteed not executed.
pub const RETRYABLE_SET: &[i32] = &[10004, 10020, 10021, 10024];
/// `CONDITIONAL_SET`.
pub const CONDITIONAL_SET: &[i32] = &[10007, 10018, 10023, 10025];
/// `PERMANENT_SET`.
pub const PERMANENT_SET: &[i32] = &[
    10006, 10011, 10013, 10014, 10015, 10016, 10017, 10019, 10022, 10026, 10027, 10028, 10029,
    10030, 10032, 10033, 10034, 10035, 10036, 10038, 10039, 10040, 10041, 10042, 10043, 10044,
    10045,
];

/// `classify_retcode(code)` → [`ErrorClassification`] (§4.2).
pub fn classify_retcode(code: i32) -> ErrorClassification {
    if SUCCESS_SET.contains(&code) {
        ErrorClassification::Success
    } else if PARTIAL_SET.contains(&code) {
        ErrorClassification::Partial
    } else if VERIFY_REQUIRED_SET.contains(&code) {
        ErrorClassification::VerifyRequired
    } else if RETRYABLE_SET.contains(&code) {
        ErrorClassification::Retryable
    } else if CONDITIONAL_SET.contains(&code) {
        ErrorClassification::Conditional
    } else if PERMANENT_SET.contains(&code) {
        ErrorClassification::Permanent
    } else {
        ErrorClassification::Unknown
    }
}

/// Classification → outcome mapping (§4.7): the public API boundary.
///
/// CONDITIONAL and UNKNOWN map to `VerifyRequired`, never to `Retry` or
/// `PermanentFailure` — the order may have executed, so the safe default is
/// to verify, never to retry or give up blindly.
pub fn outcome_for(classification: ErrorClassification) -> TransactionOutcome {
    match classification {
        ErrorClassification::Success => TransactionOutcome::Success,
        ErrorClassification::Partial => TransactionOutcome::Partial,
        ErrorClassification::Retryable => TransactionOutcome::Retry,
        ErrorClassification::VerifyRequired => TransactionOutcome::VerifyRequired,
        ErrorClassification::Permanent => TransactionOutcome::PermanentFailure,
        ErrorClassification::Conditional | ErrorClassification::Unknown => {
            TransactionOutcome::VerifyRequired
        }
    }
}

/// `OPERATION_CRITICALITY` table (§4.2). Unknown operations default to `Normal`.
pub fn operation_criticality(operation: &str) -> OperationCriticality {
    match operation {
        "order_send" | "order_check" => OperationCriticality::Critical,
        "positions_get" | "account_info" | "orders_get" => OperationCriticality::High,
        "symbol_info" => OperationCriticality::Normal,
        "symbols_total" | "version" => OperationCriticality::Low,
        op if op.starts_with("copy_rates_") => OperationCriticality::Normal,
        _ => OperationCriticality::Normal,
    }
}

/// `should_verify_state(op, classification)` (§4.2): true iff the operation
/// is CRITICAL and the classification is one where the order's true state is
/// ambiguous.
pub fn should_verify_state(operation: &str, classification: ErrorClassification) -> bool {
    operation_criticality(operation) == OperationCriticality::Critical
        && matches!(
            classification,
            ErrorClassification::Conditional
                | ErrorClassification::Unknown
                | ErrorClassification::VerifyRequired
        )
}

/// `is_retryable_exception(e)` (§4.2): true for retryable transport codes and
/// our own `RetryableError`-equivalent states; false for programmer errors.
pub fn is_retryable_exception(err: &BridgeError) -> bool {
    err.is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all_sets() -> [&'static [i32]; 6] {
        [
            SUCCESS_SET,
            PARTIAL_SET,
            VERIFY_REQUIRED_SET,
            RETRYABLE_SET,
            CONDITIONAL_SET,
            PERMANENT_SET,
        ]
    }

    #[test]
    fn retcode_sets_are_pairwise_disjoint() {
        let sets = all_sets();
        for i in 0..sets.len() {
            for j in (i + 1)..sets.len() {
                let a: HashSet<_> = sets[i].iter().collect();
                let b: HashSet<_> = sets[j].iter().collect();
                assert!(
                    a.is_disjoint(&b),
                    "sets {i} and {j} overlap: {:?}",
                    a.intersection(&b).collect::<Vec<_>>()
                );
            }
        }
    }

    #[test]
    fn classify_matches_membership_for_every_known_code() {
        for &code in SUCCESS_SET {
            assert_eq!(classify_retcode(code), ErrorClassification::Success);
        }
        for &code in PARTIAL_SET {
            assert_eq!(classify_retcode(code), ErrorClassification::Partial);
        }
        for &code in VERIFY_REQUIRED_SET {
            assert_eq!(classify_retcode(code), ErrorClassification::VerifyRequired);
        }
        for &code in RETRYABLE_SET {
            assert_eq!(classify_retcode(code), ErrorClassification::Retryable);
        }
        for &code in CONDITIONAL_SET {
            assert_eq!(classify_retcode(code), ErrorClassification::Conditional);
        }
        for &code in PERMANENT_SET {
            assert_eq!(classify_retcode(code), ErrorClassification::Permanent);
        }
        assert_eq!(classify_retcode(999_999), ErrorClassification::Unknown);
    }

    #[test]
    fn timeout_and_connection_are_never_retryable() {
        assert_ne!(classify_retcode(10012), ErrorClassification::Retryable);
        assert_ne!(classify_retcode(10031), ErrorClassification::Retryable);
        assert!(!RETRYABLE_SET.contains(&10012));
        assert!(!RETRYABLE_SET.contains(&10031));
    }

    #[test]
    fn should_verify_state_holds_only_for_critical_ambiguous_outcomes() {
        for &classification in &[
            ErrorClassification::Conditional,
            ErrorClassification::Unknown,
            ErrorClassification::VerifyRequired,
        ] {
            assert!(should_verify_state("order_send", classification));
        }
        for &classification in &[
            ErrorClassification::Success,
            ErrorClassification::Partial,
            ErrorClassification::Retryable,
            ErrorClassification::Permanent,
        ] {
            assert!(!should_verify_state("order_send", classification));
        }
        assert!(!should_verify_state(
            "account_info",
            ErrorClassification::Unknown
        ));
    }

    #[test]
    fn conditional_and_unknown_never_map_to_retry_or_permanent() {
        assert_eq!(
            outcome_for(ErrorClassification::Conditional),
            TransactionOutcome::VerifyRequired
        );
        assert_eq!(
            outcome_for(ErrorClassification::Unknown),
            TransactionOutcome::VerifyRequired
        );
    }
}
