use std::time::Duration;

/// Heartbeat (application-level ping/pong) settings.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Period between pings. A connection that misses a single cycle is closed.
    pub interval_ms: u64,
    /// Accepted for compatibility with existing deployments. The effective
    /// timeout is always exactly one `interval_ms`.
    pub timeout_ms: u64,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 10_000,
        }
    }
}

/// Outbound buffer limits used to drop pushes for slow consumers.
#[derive(Debug, Clone, Copy)]
pub struct BackpressureConfig {
    pub max_buffered_bytes: usize,
    /// Fraction of `max_buffered_bytes` at which pushes start being dropped.
    pub high_water_mark: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: 1024 * 1024,
            high_water_mark: 0.8,
        }
    }
}

/// Sliding-window request limit, shared by all connections.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_subscriptions_per_connection: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 100,
        }
    }
}

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port the server binds to. `0` picks an ephemeral port.
    pub port: u16,
    pub host: String,
    /// Route serving the WebSocket upgrade (e.g. `/ws`).
    pub path: String,
    /// Maximum size of a single inbound message.
    pub max_payload_bytes: usize,
    pub heartbeat: HeartbeatConfig,
    pub backpressure: BackpressureConfig,
    /// `None` disables rate limiting entirely.
    pub rate_limit: Option<RateLimitConfig>,
    pub connection_limits: ConnectionLimits,
    /// Grace period used by the binary on SIGINT/SIGTERM.
    pub shutdown_grace_ms: u64,
    /// How long a single connection may take to terminate during force-stop.
    pub stop_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4100,
            host: "0.0.0.0".to_string(),
            path: "/ws".to_string(),
            max_payload_bytes: 1024 * 1024,
            heartbeat: HeartbeatConfig::default(),
            backpressure: BackpressureConfig::default(),
            rate_limit: None,
            connection_limits: ConnectionLimits::default(),
            shutdown_grace_ms: 5_000,
            stop_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `PULSE_*` environment variables.
    ///
    /// Missing or unparsable values fall back to the defaults. Rate limiting is
    /// enabled only when both `PULSE_RATE_LIMIT_MAX_REQUESTS` and
    /// `PULSE_RATE_LIMIT_WINDOW_MS` are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let rate_limit = match (
            parsed("PULSE_RATE_LIMIT_MAX_REQUESTS").and_then(|v| v.parse().ok()),
            parsed("PULSE_RATE_LIMIT_WINDOW_MS").and_then(|v| v.parse().ok()),
        ) {
            (Some(max_requests), Some(window_ms)) => Some(RateLimitConfig {
                max_requests,
                window_ms,
            }),
            _ => None,
        };

        Self {
            port: parse_or(parsed("PULSE_PORT"), defaults.port),
            host: parsed("PULSE_HOST").unwrap_or(defaults.host),
            path: parsed("PULSE_PATH").unwrap_or(defaults.path),
            max_payload_bytes: parse_or(
                parsed("PULSE_MAX_PAYLOAD_BYTES"),
                defaults.max_payload_bytes,
            ),
            heartbeat: HeartbeatConfig {
                interval_ms: parse_nonzero(
                    parsed("PULSE_HEARTBEAT_INTERVAL_MS"),
                    defaults.heartbeat.interval_ms,
                ),
                timeout_ms: parse_or(
                    parsed("PULSE_HEARTBEAT_TIMEOUT_MS"),
                    defaults.heartbeat.timeout_ms,
                ),
            },
            backpressure: BackpressureConfig {
                max_buffered_bytes: parse_or(
                    parsed("PULSE_MAX_BUFFERED_BYTES"),
                    defaults.backpressure.max_buffered_bytes,
                ),
                high_water_mark: parse_or(
                    parsed("PULSE_HIGH_WATER_MARK"),
                    defaults.backpressure.high_water_mark,
                ),
            },
            rate_limit,
            connection_limits: ConnectionLimits {
                max_subscriptions_per_connection: parse_or(
                    parsed("PULSE_MAX_SUBSCRIPTIONS"),
                    defaults.connection_limits.max_subscriptions_per_connection,
                ),
            },
            shutdown_grace_ms: parse_or(
                parsed("PULSE_SHUTDOWN_GRACE_MS"),
                defaults.shutdown_grace_ms,
            ),
            stop_timeout_ms: parse_or(parsed("PULSE_STOP_TIMEOUT_MS"), defaults.stop_timeout_ms),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Like [`parse_or`], but `0` also falls back to the default.
fn parse_nonzero(value: Option<String>, default: u64) -> u64 {
    match parse_or(value, default) {
        0 => default,
        n => n,
    }
}
