//! Single source of tunables for the bridge (§3, §4.1).
//!
//! `Config` is immutable after construction. It is loaded from `MT5_`-prefixed
//! environment variables (with an optional `.env` file loaded first, mirroring
//! the `dotenvy::dotenv().ok()` convention) or assembled programmatically via
//! [`ConfigBuilder`] — the same two paths the teacher's resilience layers
//! expose through `::builder()`.

use std::env;
use std::time::Duration;

use rand::Rng;

use crate::error::BridgeError;

/// Immutable runtime configuration for the bridge.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub grpc_port: u16,
    /// Docker host-mapped port; not consulted by the core, only by deployment tooling.
    pub docker_grpc_port: u16,
    /// Isolated test-harness port; not consulted by the core.
    pub test_grpc_port: u16,
    /// The terminal's own health-check service port; the `HealthCheck` RPC
    /// lives on the same channel as every other RPC, so this is deployment
    /// metadata only, not dialed separately by `ConnectionManager`.
    pub health_port: u16,

    pub connection_timeout: Duration,
    /// Per-RPC deadline applied at each call site, independent of channel
    /// establishment (§5, §9 open-question resolution on the two distinct
    /// "timeout" concepts).
    pub call_timeout: Duration,

    pub retry_max_attempts: usize,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_exponential_base: f64,
    pub retry_jitter: bool,

    pub cb_threshold: u32,
    pub cb_recovery_seconds: f64,
    pub cb_half_open_max: u32,

    pub queue_max_concurrent: usize,
    pub queue_max_depth: usize,

    pub wal_path: String,
    pub wal_retention_days: i64,

    pub enable_auto_reconnect: bool,
    pub enable_health_monitor: bool,
    pub enable_circuit_breaker: bool,

    pub critical_retry_max_attempts: usize,
    pub critical_retry_initial_delay: Duration,
    pub critical_retry_max_delay: Duration,

    pub recovery_search_window_seconds: i64,
    pub health_monitor_interval_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            grpc_port: 8001,
            docker_grpc_port: 18001,
            test_grpc_port: 28001,
            health_port: 8002,

            connection_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),

            retry_max_attempts: 3,
            retry_initial_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            retry_exponential_base: 2.0,
            retry_jitter: true,

            cb_threshold: 5,
            cb_recovery_seconds: 30.0,
            cb_half_open_max: 3,

            queue_max_concurrent: 10,
            queue_max_depth: 100,

            wal_path: "mt5_wal.sqlite3".to_string(),
            wal_retention_days: 7,

            enable_auto_reconnect: true,
            enable_health_monitor: true,
            enable_circuit_breaker: true,

            critical_retry_max_attempts: 5,
            critical_retry_initial_delay: Duration::from_millis(100),
            critical_retry_max_delay: Duration::from_secs(15),

            recovery_search_window_seconds: 900,
            health_monitor_interval_seconds: 30,
        }
    }
}

impl Config {
    /// Loads configuration from `MT5_*` environment variables, reading an
    /// optional `.env` file in the current directory first. Absent variables
    /// fall back to [`Config::default`]; present-but-malformed variables are
    /// a construction error (never a silent fallback).
    pub fn from_env() -> Result<Self, BridgeError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        Ok(Config {
            host: env_or(&defaults.host, "MT5_HOST"),
            grpc_port: env_parsed_or(defaults.grpc_port, "MT5_GRPC_PORT")?,
            docker_grpc_port: env_parsed_or(defaults.docker_grpc_port, "MT5_DOCKER_GRPC_PORT")?,
            test_grpc_port: env_parsed_or(defaults.test_grpc_port, "MT5_TEST_GRPC_PORT")?,
            health_port: env_parsed_or(defaults.health_port, "MT5_HEALTH_PORT")?,

            connection_timeout: env_secs_or(defaults.connection_timeout, "MT5_CONNECTION_TIMEOUT")?,
            call_timeout: env_secs_f64_or(defaults.call_timeout, "MT5_CALL_TIMEOUT")?,

            retry_max_attempts: env_parsed_or(defaults.retry_max_attempts, "MT5_RETRY_MAX_ATTEMPTS")?,
            retry_initial_delay: env_secs_f64_or(
                defaults.retry_initial_delay,
                "MT5_RETRY_INITIAL_DELAY",
            )?,
            retry_max_delay: env_secs_f64_or(defaults.retry_max_delay, "MT5_RETRY_MAX_DELAY")?,
            retry_exponential_base: env_parsed_or(
                defaults.retry_exponential_base,
                "MT5_RETRY_EXPONENTIAL_BASE",
            )?,
            retry_jitter: env_bool_or(defaults.retry_jitter, "MT5_RETRY_JITTER")?,

            cb_threshold: env_parsed_or(defaults.cb_threshold, "MT5_CB_THRESHOLD")?,
            cb_recovery_seconds: env_parsed_or(defaults.cb_recovery_seconds, "MT5_CB_RECOVERY_SECONDS")?,
            cb_half_open_max: env_parsed_or(defaults.cb_half_open_max, "MT5_CB_HALF_OPEN_MAX")?,

            queue_max_concurrent: env_parsed_or(
                defaults.queue_max_concurrent,
                "MT5_QUEUE_MAX_CONCURRENT",
            )?,
            queue_max_depth: env_parsed_or(defaults.queue_max_depth, "MT5_QUEUE_MAX_DEPTH")?,

            wal_path: env_or(&defaults.wal_path, "MT5_WAL_PATH"),
            wal_retention_days: env_parsed_or(defaults.wal_retention_days, "MT5_WAL_RETENTION_DAYS")?,

            enable_auto_reconnect: env_bool_or(
                defaults.enable_auto_reconnect,
                "MT5_ENABLE_AUTO_RECONNECT",
            )?,
            enable_health_monitor: env_bool_or(
                defaults.enable_health_monitor,
                "MT5_ENABLE_HEALTH_MONITOR",
            )?,
            enable_circuit_breaker: env_bool_or(
                defaults.enable_circuit_breaker,
                "MT5_ENABLE_CIRCUIT_BREAKER",
            )?,

            critical_retry_max_attempts: env_parsed_or(
                defaults.critical_retry_max_attempts,
                "MT5_CRITICAL_RETRY_MAX_ATTEMPTS",
            )?,
            critical_retry_initial_delay: env_secs_f64_or(
                defaults.critical_retry_initial_delay,
                "MT5_CRITICAL_RETRY_INITIAL_DELAY",
            )?,
            critical_retry_max_delay: env_secs_f64_or(
                defaults.critical_retry_max_delay,
                "MT5_CRITICAL_RETRY_MAX_DELAY",
            )?,

            recovery_search_window_seconds: env_parsed_or(
                defaults.recovery_search_window_seconds,
                "MT5_RECOVERY_SEARCH_WINDOW_SECONDS",
            )?,
            health_monitor_interval_seconds: env_parsed_or(
                defaults.health_monitor_interval_seconds,
                "MT5_HEALTH_MONITOR_INTERVAL_SECONDS",
            )?,
        })
    }

    /// Returns a builder seeded with defaults, for programmatic construction
    /// in tests and embedding applications.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// `delay_for(attempt)`: `min(initial * base^attempt, max_delay)`,
    /// optionally scaled by a uniform random factor in `[0.5, 1.5]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        delay_for(
            self.retry_initial_delay,
            self.retry_max_delay,
            self.retry_exponential_base,
            self.retry_jitter,
            attempt,
        )
    }

    /// `critical_delay_for(attempt)`: same shape as [`Config::delay_for`] but
    /// using the faster critical-path initial delay and ceiling.
    pub fn critical_delay_for(&self, attempt: u32) -> Duration {
        delay_for(
            self.critical_retry_initial_delay,
            self.critical_retry_max_delay,
            self.retry_exponential_base,
            self.retry_jitter,
            attempt,
        )
    }

    /// Channel options the client MUST set (§6): 50 MiB message caps, 30s
    /// keepalive time, 10s keepalive timeout.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            max_send_message_bytes: 50 * 1024 * 1024,
            max_receive_message_bytes: 50 * 1024 * 1024,
            keepalive_time: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
        }
    }
}

/// Tuned gRPC channel options (§6).
#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub max_send_message_bytes: usize,
    pub max_receive_message_bytes: usize,
    pub keepalive_time: Duration,
    pub keepalive_timeout: Duration,
}

fn delay_for(
    initial: Duration,
    max: Duration,
    base: f64,
    jitter: bool,
    attempt: u32,
) -> Duration {
    let scaled = initial.as_secs_f64() * base.powi(attempt as i32);
    let bounded = scaled.min(max.as_secs_f64());
    let jittered = if jitter {
        let factor = rand::rng().random_range(0.5..=1.5);
        bounded * factor
    } else {
        bounded
    };
    Duration::from_secs_f64(jittered.max(0.0))
}

/// Builder for [`Config`], mirroring the teacher's `*ConfigBuilder` convention.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: OptionalConfig,
}

#[derive(Debug, Clone, Default)]
struct OptionalConfig {
    host: Option<String>,
    grpc_port: Option<u16>,
    connection_timeout: Option<Duration>,
    call_timeout: Option<Duration>,
    retry_max_attempts: Option<usize>,
    retry_initial_delay: Option<Duration>,
    retry_max_delay: Option<Duration>,
    cb_threshold: Option<u32>,
    cb_recovery_seconds: Option<f64>,
    cb_half_open_max: Option<u32>,
    queue_max_concurrent: Option<usize>,
    queue_max_depth: Option<usize>,
    wal_path: Option<String>,
    wal_retention_days: Option<i64>,
    critical_retry_max_attempts: Option<usize>,
    critical_retry_initial_delay: Option<Duration>,
    critical_retry_max_delay: Option<Duration>,
    recovery_search_window_seconds: Option<i64>,
}

macro_rules! builder_setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.config.$name = Some(value);
            self
        }
    };
}

impl ConfigBuilder {
    builder_setter!(host, String);
    builder_setter!(grpc_port, u16);
    builder_setter!(connection_timeout, Duration);
    builder_setter!(call_timeout, Duration);
    builder_setter!(retry_max_attempts, usize);
    builder_setter!(retry_initial_delay, Duration);
    builder_setter!(retry_max_delay, Duration);
    builder_setter!(cb_threshold, u32);
    builder_setter!(cb_recovery_seconds, f64);
    builder_setter!(cb_half_open_max, u32);
    builder_setter!(queue_max_concurrent, usize);
    builder_setter!(queue_max_depth, usize);
    builder_setter!(wal_path, String);
    builder_setter!(wal_retention_days, i64);
    builder_setter!(critical_retry_max_attempts, usize);
    builder_setter!(critical_retry_initial_delay, Duration);
    builder_setter!(critical_retry_max_delay, Duration);
    builder_setter!(recovery_search_window_seconds, i64);

    /// Builds a [`Config`], filling anything unset from [`Config::default`].
    pub fn build(self) -> Config {
        let d = Config::default();
        let o = self.config;
        Config {
            host: o.host.unwrap_or(d.host),
            grpc_port: o.grpc_port.unwrap_or(d.grpc_port),
            connection_timeout: o.connection_timeout.unwrap_or(d.connection_timeout),
            call_timeout: o.call_timeout.unwrap_or(d.call_timeout),
            retry_max_attempts: o.retry_max_attempts.unwrap_or(d.retry_max_attempts),
            retry_initial_delay: o.retry_initial_delay.unwrap_or(d.retry_initial_delay),
            retry_max_delay: o.retry_max_delay.unwrap_or(d.retry_max_delay),
            cb_threshold: o.cb_threshold.unwrap_or(d.cb_threshold),
            cb_recovery_seconds: o.cb_recovery_seconds.unwrap_or(d.cb_recovery_seconds),
            cb_half_open_max: o.cb_half_open_max.unwrap_or(d.cb_half_open_max),
            queue_max_concurrent: o.queue_max_concurrent.unwrap_or(d.queue_max_concurrent),
            queue_max_depth: o.queue_max_depth.unwrap_or(d.queue_max_depth),
            wal_path: o.wal_path.unwrap_or(d.wal_path),
            wal_retention_days: o.wal_retention_days.unwrap_or(d.wal_retention_days),
            critical_retry_max_attempts: o
                .critical_retry_max_attempts
                .unwrap_or(d.critical_retry_max_attempts),
            critical_retry_initial_delay: o
                .critical_retry_initial_delay
                .unwrap_or(d.critical_retry_initial_delay),
            critical_retry_max_delay: o
                .critical_retry_max_delay
                .unwrap_or(d.critical_retry_max_delay),
            recovery_search_window_seconds: o
                .recovery_search_window_seconds
                .unwrap_or(d.recovery_search_window_seconds),
            ..d
        }
    }
}

fn env_or(default: &str, key: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed_or<T: std::str::FromStr>(default: T, key: &str) -> Result<T, BridgeError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BridgeError::Config(format!("invalid value for {key}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}

fn env_bool_or(default: bool, key: &str) -> Result<bool, BridgeError> {
    match env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(BridgeError::Config(format!("invalid bool for {key}: {raw:?}"))),
        },
        Err(_) => Ok(default),
    }
}

fn env_secs_or(default: Duration, key: &str) -> Result<Duration, BridgeError> {
    env_parsed_or(default.as_secs(), key).map(Duration::from_secs)
}

fn env_secs_f64_or(default: Duration, key: &str) -> Result<Duration, BridgeError> {
    env_parsed_or(default.as_secs_f64(), key).map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_delay_for_grows_exponentially_without_jitter() {
        let config = Config::builder().retry_max_attempts(5).build();
        let mut config = config;
        config.retry_jitter = false;
        assert_eq!(config.delay_for(0), Duration::from_millis(500));
        assert_eq!(config.delay_for(1), Duration::from_secs(1));
        assert_eq!(config.delay_for(2), Duration::from_secs(2));
    }

    #[test]
    fn delay_for_is_capped_at_max_delay_with_jitter_bound() {
        let config = Config::default();
        for attempt in 0..20 {
            let d = config.delay_for(attempt);
            assert!(d.as_secs_f64() <= config.retry_max_delay.as_secs_f64() * 1.5 + 1e-9);
        }
    }

    #[test]
    fn critical_delay_uses_faster_initial_and_lower_ceiling() {
        let config = Config::default();
        assert!(config.critical_retry_initial_delay < config.retry_initial_delay);
        assert!(config.critical_retry_max_delay < config.retry_max_delay);
    }

    #[test]
    fn channel_options_match_spec() {
        let config = Config::default();
        let opts = config.channel_options();
        assert_eq!(opts.max_send_message_bytes, 50 * 1024 * 1024);
        assert_eq!(opts.max_receive_message_bytes, 50 * 1024 * 1024);
        assert_eq!(opts.keepalive_time, Duration::from_secs(30));
        assert_eq!(opts.keepalive_timeout, Duration::from_secs(10));
    }

    #[test]
    fn builder_fills_unset_fields_from_default() {
        let config = Config::builder().grpc_port(9999).build();
        assert_eq!(config.grpc_port, 9999);
        assert_eq!(config.host, Config::default().host);
    }
}
