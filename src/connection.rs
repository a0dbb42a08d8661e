//! Connection and health lifecycle management (§4.8).
//!
//! Grounded on the teacher's `tower-resilience-reconnect::state::ReconnectState`
//! (the `Connected`/`Disconnected`/`Reconnecting` tri-state and atomic
//! attempt counter), adapted from a generic Tower reconnect-middleware state
//! to a gRPC `Channel` owner with idempotent, mutex-serialized connect and
//! disconnect, a loaded `Constants` table, and an optional background health
//! monitor task.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use crate::circuit::CircuitBreaker;
use crate::config::Config;
use crate::constants::RemoteConstants;
use crate::error::BridgeError;
use crate::proto::mt5::mt5_service_client::Mt5ServiceClient;
use crate::proto::mt5::Empty;
use crate::retry::{reconnect_with_backoff, RetryPolicy};

/// Connection lifecycle state (§4.8), mirroring the teacher's
/// `ConnectionState` tri-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

struct StateTracker {
    state: AtomicU64,
    attempts: AtomicU32,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(encode(ConnectionState::Disconnected)),
            attempts: AtomicU32::new(0),
        }
    }

    fn state(&self) -> ConnectionState {
        decode(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: ConnectionState) {
        self.state.store(encode(state), Ordering::Release);
    }

    fn mark_connected(&self) {
        self.set(ConnectionState::Connected);
        self.attempts.store(0, Ordering::Release);
    }

    fn increment_attempts(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::AcqRel) + 1
    }
}

fn encode(state: ConnectionState) -> u64 {
    match state {
        ConnectionState::Connected => 0,
        ConnectionState::Disconnected => 1,
        ConnectionState::Reconnecting => 2,
    }
}

fn decode(value: u64) -> ConnectionState {
    match value {
        0 => ConnectionState::Connected,
        1 => ConnectionState::Disconnected,
        _ => ConnectionState::Reconnecting,
    }
}

/// Health status snapshot (§3 `HealthStatus`).
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub mt5_available: bool,
    pub connected: bool,
    pub trade_allowed: bool,
    pub build: i32,
    pub reason: Option<String>,
}

/// Owns the gRPC channel, the connection state machine, the loaded
/// `Constants` table, and (optionally) a background health-monitor task.
pub struct ConnectionManager {
    config: Config,
    channel: RwLock<Option<Channel>>,
    constants: RwLock<RemoteConstants>,
    state: StateTracker,
    connect_lock: AsyncMutex<()>,
    health_task: AsyncMutex<Option<JoinHandle<()>>>,
    breaker: RwLock<Option<Arc<CircuitBreaker>>>,
}

impl ConnectionManager {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            channel: RwLock::new(None),
            constants: RwLock::new(RemoteConstants::default()),
            state: StateTracker::new(),
            connect_lock: AsyncMutex::new(()),
            health_task: AsyncMutex::new(None),
            breaker: RwLock::new(None),
        })
    }

    /// Gives the health monitor a breaker to report consecutive probe
    /// failures to (§4.8). Must be called before `connect()` for the first
    /// monitor tick to see it; a breaker set later applies to later ticks.
    pub fn set_breaker(&self, breaker: Arc<CircuitBreaker>) {
        *self.breaker.write() = Some(breaker);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Loaded named-constant table (§4.8, §10.6); empty until the first
    /// successful connect.
    pub fn constants(&self) -> RemoteConstants {
        self.constants.read().clone()
    }

    /// Returns the active channel, or `Err(BridgeError::Connection)` if not
    /// currently connected.
    pub fn channel(&self) -> Result<Channel, BridgeError> {
        self.channel.read().clone().ok_or(BridgeError::Connection)
    }

    /// Connects (or reuses an existing connection) to the terminal bridge
    /// service, with tuned channel options (§6), then loads the constants
    /// table. Idempotent: concurrent callers serialize on `connect_lock` and
    /// a caller that finds the channel already live returns immediately.
    pub async fn connect(self: &Arc<Self>) -> Result<(), BridgeError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.state.set(ConnectionState::Reconnecting);
        self.state.increment_attempts();

        let uri = format!("http://{}:{}", self.config.host, self.config.grpc_port);
        let opts = self.config.channel_options();
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| BridgeError::Config(format!("invalid endpoint: {e}")))?
            .connect_timeout(self.config.connection_timeout)
            .tcp_keepalive(Some(opts.keepalive_time))
            .keep_alive_timeout(opts.keepalive_timeout)
            .keep_alive_while_idle(true);

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| BridgeError::Transport(tonic::Status::unavailable(e.to_string())))?;

        *self.channel.write() = Some(channel.clone());
        self.state.mark_connected();
        debug!("mt5 bridge channel connected");

        self.load_constants(channel).await?;

        if self.config.enable_health_monitor {
            self.spawn_health_monitor();
        }

        Ok(())
    }

    async fn load_constants(&self, channel: Channel) -> Result<(), BridgeError> {
        let mut client = Mt5ServiceClient::new(channel)
            .max_decoding_message_size(self.config.channel_options().max_receive_message_bytes)
            .max_encoding_message_size(self.config.channel_options().max_send_message_bytes);
        let response = client.get_constants(Empty {}).await?;
        let table = RemoteConstants::from_map(response.into_inner().values);
        *self.constants.write() = table;
        Ok(())
    }

    /// Idempotent disconnect: drops the channel and cancels the health
    /// monitor task, if any.
    pub async fn disconnect(&self) {
        let _guard = self.connect_lock.lock().await;
        *self.channel.write() = None;
        self.state.set(ConnectionState::Disconnected);
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
        }
    }

    /// `ensure_connected()` (§4.8): connects if not already connected,
    /// otherwise a no-op.
    pub async fn ensure_connected(self: &Arc<Self>) -> Result<(), BridgeError> {
        if self.is_connected() {
            Ok(())
        } else {
            self.connect().await
        }
    }

    /// Queries the terminal's health RPC directly, bypassing the queue —
    /// used both by the public `health_check` façade call and by the
    /// background monitor.
    pub async fn check_health(&self) -> Result<HealthStatus, BridgeError> {
        let channel = self.channel()?;
        let mut client = Mt5ServiceClient::new(channel);
        let response = client.health_check(Empty {}).await?.into_inner();
        Ok(HealthStatus {
            healthy: response.healthy,
            mt5_available: response.mt5_available,
            connected: response.connected,
            trade_allowed: response.trade_allowed,
            build: response.build,
            reason: if response.reason.is_empty() {
                None
            } else {
                Some(response.reason)
            },
        })
    }

    /// Spawns a periodic background health check (§4.8). Resolved open
    /// question: this task calls `record_failure` on the shared breaker
    /// independently of any in-flight RPC doing the same — the design
    /// accepts the resulting double-counting on concurrent failures rather
    /// than adding cross-task suppression.
    fn spawn_health_monitor(self: &Arc<Self>) {
        let this = self.clone();
        let interval = Duration::from_secs(self.config.health_monitor_interval_seconds);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let started = Instant::now();
                match this.check_health().await {
                    Ok(status) if !status.healthy => {
                        warn!(
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            reason = status.reason.as_deref().unwrap_or(""),
                            "mt5 bridge health monitor observed unhealthy terminal"
                        );
                        if let Some(breaker) = this.breaker.read().clone() {
                            breaker.record_failure();
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "mt5 bridge health monitor check failed");
                        if let Some(breaker) = this.breaker.read().clone() {
                            breaker.record_failure();
                        }
                        if this.config.enable_auto_reconnect {
                            this.state.set(ConnectionState::Disconnected);
                            *this.channel.write() = None;
                            let policy = RetryPolicy::standard(&this.config);
                            let reconnecting = this.clone();
                            if reconnect_with_backoff(&policy, |_attempt| {
                                let reconnecting = reconnecting.clone();
                                async move { reconnecting.connect().await }
                            })
                            .await
                            .is_err()
                            {
                                warn!("mt5 bridge auto-reconnect exhausted its attempts, will retry next tick");
                            }
                        }
                    }
                    _ => {}
                }
            }
        });
        if let Ok(mut slot) = this.health_task.try_lock() {
            *slot = Some(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_manager_starts_disconnected_with_no_attempts() {
        let manager = ConnectionManager::new(Config::default());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
    }

    #[test]
    fn mark_connected_resets_attempt_counter() {
        let tracker = StateTracker::new();
        tracker.increment_attempts();
        tracker.increment_attempts();
        assert_eq!(tracker.attempts.load(Ordering::Acquire), 2);
        tracker.mark_connected();
        assert_eq!(tracker.state(), ConnectionState::Connected);
        assert_eq!(tracker.attempts.load(Ordering::Acquire), 0);
    }

    #[test]
    fn encode_decode_roundtrips_every_state() {
        for state in [
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
        ] {
            assert_eq!(decode(encode(state)), state);
        }
    }

    #[test]
    fn set_breaker_is_observable_through_reads() {
        let manager = ConnectionManager::new(Config::default());
        assert!(manager.breaker.read().is_none());
        let breaker = Arc::new(CircuitBreaker::new(3, Duration::from_secs(1), 1));
        manager.set_breaker(breaker);
        assert!(manager.breaker.read().is_some());
    }
}
