//! Crate-wide error type for the MT5 bridge.
//!
//! Every fallible operation in the reliability stack (§7 of the design)
//! surfaces one [`BridgeError`] variant rather than a layer-specific type,
//! so callers can match on a single enum regardless of which component
//! (queue, breaker, retry, orchestrator, WAL, transport) produced it.

use std::time::{Duration, SystemTime};

use thiserror::Error;

/// Unified error type for the bridge's reliability and transaction layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The circuit breaker refused admission.
    #[error("circuit breaker open, recovers at {recovers_at:?}")]
    CircuitOpen {
        /// When the breaker is expected to transition to half-open.
        recovers_at: SystemTime,
    },

    /// The request queue is at capacity (backpressure signal, not a bug).
    #[error("request queue full (depth {depth}/{max_depth})")]
    QueueFull {
        /// Current queue depth at rejection time.
        depth: usize,
        /// Configured maximum depth.
        max_depth: usize,
    },

    /// The retry loop exhausted all attempts on retryable failures.
    #[error("retry attempts exhausted after {attempts} attempts: {source}")]
    MaxRetries {
        /// Number of attempts made.
        attempts: usize,
        /// The last error observed.
        #[source]
        source: Box<BridgeError>,
    },

    /// Terminal returned a retcode classified PERMANENT, or verification
    /// determined the order did not execute, or further retry was judged
    /// unsafe.
    #[error("permanent failure{}: {message}", retcode.map(|c| format!(" (retcode {c})")).unwrap_or_default())]
    Permanent {
        /// The terminal retcode, if one was available.
        retcode: Option<i32>,
        /// Human-readable context.
        message: String,
    },

    /// An RPC returned no payload where one was expected.
    #[error("empty response from operation {operation}")]
    EmptyResponse {
        /// Name of the operation that returned nothing.
        operation: String,
    },

    /// The client is not connected, or the connection was lost.
    #[error("not connected")]
    Connection,

    /// A requested feature or module is not available on the remote terminal.
    #[error("not available: {0}")]
    NotAvailable(String),

    /// A transport-level (gRPC) failure.
    #[error("transport error: {0}")]
    Transport(#[from] tonic::Status),

    /// A WAL storage failure.
    #[error("wal error: {0}")]
    Wal(#[from] rusqlite::Error),

    /// A configuration construction error (malformed environment variable).
    #[error("config error: {0}")]
    Config(String),

    /// A JSON (de)serialization failure at the façade boundary.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A malformed binary numeric-array payload (bad dtype string, short buffer).
    #[error("array decode error: {0}")]
    ArrayDecode(String),

    /// The work factory's own application-level error, opaque to this crate.
    #[error("operation error: {0}")]
    Operation(String),
}

impl BridgeError {
    /// Returns `true` if this is a circuit-open rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, BridgeError::CircuitOpen { .. })
    }

    /// Returns `true` if this is a queue backpressure rejection.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, BridgeError::QueueFull { .. })
    }

    /// Returns `true` if this is a permanent (non-retryable) failure.
    pub fn is_permanent(&self) -> bool {
        matches!(self, BridgeError::Permanent { .. })
    }

    /// Returns `true` if retry attempts were exhausted.
    pub fn is_max_retries(&self) -> bool {
        matches!(self, BridgeError::MaxRetries { .. })
    }

    /// Returns the terminal retcode carried by this error, if any.
    pub fn retcode(&self) -> Option<i32> {
        match self {
            BridgeError::Permanent { retcode, .. } => *retcode,
            BridgeError::MaxRetries { source, .. } => source.retcode(),
            _ => None,
        }
    }

    /// True for errors that the retry strategy should attempt again.
    ///
    /// Mirrors `is_retryable_exception` (§4.2): retryable transport codes
    /// are retryable, programmer errors (not connected, bad config) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            BridgeError::Transport(status) => is_retryable_status(status),
            BridgeError::EmptyResponse { .. } => true,
            BridgeError::Connection
            | BridgeError::NotAvailable(_)
            | BridgeError::Config(_)
            | BridgeError::CircuitOpen { .. }
            | BridgeError::QueueFull { .. }
            | BridgeError::Permanent { .. }
            | BridgeError::MaxRetries { .. } => false,
            BridgeError::Wal(_) | BridgeError::Serialization(_) | BridgeError::ArrayDecode(_) => {
                false
            }
            BridgeError::Operation(_) => true,
        }
    }
}

/// `TRANSPORT_RETRYABLE` of §4.2: these gRPC statuses are safe to retry.
pub fn is_retryable_status(status: &tonic::Status) -> bool {
    use tonic::Code;
    matches!(
        status.code(),
        Code::Unavailable | Code::DeadlineExceeded | Code::Aborted | Code::ResourceExhausted
    )
}

/// Helper for computing a breaker recovery timestamp from "now".
pub fn recovers_at(recovery: Duration) -> SystemTime {
    SystemTime::now() + recovery
}
