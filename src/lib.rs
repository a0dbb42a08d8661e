//! Resilient client-side bridge to a MetaTrader5 trading terminal exposed
//! over gRPC (§1).
//!
//! This crate covers the reliability and transaction layer sitting between
//! a Rust caller and the remote terminal: connection/health management, a
//! circuit breaker, backoff retry, error classification, a priority request
//! queue, a write-ahead log for order durability, and a transaction
//! orchestrator for idempotent critical order submission. The gRPC wire
//! protocol, the terminal's own matching/execution logic, and presentation
//! wrappers are out of scope (§1 Non-goals) — [`client::Mt5Client`] is the
//! single typed surface callers use.

pub mod circuit;
pub mod classify;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod orchestrator;
pub mod proto;
pub mod queue;
pub mod request_id;
pub mod retry;
pub mod wal;

pub use circuit::{CircuitBreaker, CircuitState, CircuitStatus};
pub use classify::{ErrorClassification, OperationCriticality, TransactionOutcome};
pub use client::Mt5Client;
pub use codec::{RateBar, Tick};
pub use config::{Config, ConfigBuilder};
pub use connection::{ConnectionManager, ConnectionState, HealthStatus};
pub use constants::RemoteConstants;
pub use error::BridgeError;
pub use orchestrator::{OrderResult, TransactionOrchestrator, TransactionResult};
pub use queue::RequestQueue;
pub use retry::{RetryHooks, RetryPolicy};
pub use wal::{EntryStatus, Wal, WalEntry};
