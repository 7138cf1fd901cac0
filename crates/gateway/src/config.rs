// Gateway configuration.
//
// Environment variables with defaults suitable for local development.

use std::net::SocketAddr;
use std::time::Duration;

use crate::pool::DEFAULT_MAX_CONNECTIONS_PER_USER;

const DEV_JWT_SECRET: &str = "collabornest_local_development_jwt_secret_32_chars";

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_JWT_ISSUER: &str = "collabornest";
pub const DEFAULT_JWT_AUDIENCE: &str = "collabornest-users";
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 25_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_HEARTBEAT_MAX_MISSED: u32 = 2;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Transport liveness probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between pings.
    pub interval: Duration,
    /// How long a ping may stay unanswered before it counts as missed.
    pub timeout: Duration,
    /// Consecutive misses that close the connection.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            max_missed: DEFAULT_HEARTBEAT_MAX_MISSED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub max_connections_per_user: usize,
    pub heartbeat: HeartbeatConfig,
    pub shutdown_grace: Duration,
    /// Log filter directive (e.g. `info`, `collabornest_gateway=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_env_fn(|_| Err(std::env::VarError::NotPresent))
    }
}

impl GatewayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `COLLABORNEST_GATEWAY_HOST` | `0.0.0.0` |
    /// | `COLLABORNEST_GATEWAY_PORT` | `3000` |
    /// | `COLLABORNEST_GATEWAY_JWT_SECRET` | dev-only placeholder |
    /// | `COLLABORNEST_GATEWAY_JWT_ISSUER` | `collabornest` |
    /// | `COLLABORNEST_GATEWAY_JWT_AUDIENCE` | `collabornest-users` |
    /// | `COLLABORNEST_GATEWAY_MAX_CONNECTIONS_PER_USER` | `5` |
    /// | `COLLABORNEST_GATEWAY_HEARTBEAT_INTERVAL_MS` | `25000` |
    /// | `COLLABORNEST_GATEWAY_HEARTBEAT_TIMEOUT_MS` | `20000` |
    /// | `COLLABORNEST_GATEWAY_HEARTBEAT_MAX_MISSED` | `2` |
    /// | `COLLABORNEST_GATEWAY_SHUTDOWN_GRACE_MS` | `3000` |
    /// | `COLLABORNEST_GATEWAY_LOG_FILTER` | `info` |
    /// | `COLLABORNEST_GATEWAY_LOG_FORMAT` | `text` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COLLABORNEST_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "COLLABORNEST_GATEWAY_PORT", DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret =
            env("COLLABORNEST_GATEWAY_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let jwt_issuer =
            env("COLLABORNEST_GATEWAY_JWT_ISSUER").unwrap_or_else(|_| DEFAULT_JWT_ISSUER.into());
        let jwt_audience = env("COLLABORNEST_GATEWAY_JWT_AUDIENCE")
            .unwrap_or_else(|_| DEFAULT_JWT_AUDIENCE.into());

        let max_connections_per_user = positive_or(
            &env,
            "COLLABORNEST_GATEWAY_MAX_CONNECTIONS_PER_USER",
            DEFAULT_MAX_CONNECTIONS_PER_USER,
        );
        let heartbeat = HeartbeatConfig {
            interval: Duration::from_millis(positive_or(
                &env,
                "COLLABORNEST_GATEWAY_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )),
            timeout: Duration::from_millis(positive_or(
                &env,
                "COLLABORNEST_GATEWAY_HEARTBEAT_TIMEOUT_MS",
                DEFAULT_HEARTBEAT_TIMEOUT_MS,
            )),
            max_missed: positive_or(
                &env,
                "COLLABORNEST_GATEWAY_HEARTBEAT_MAX_MISSED",
                DEFAULT_HEARTBEAT_MAX_MISSED,
            ),
        };
        let shutdown_grace = Duration::from_millis(parse_or(
            &env,
            "COLLABORNEST_GATEWAY_SHUTDOWN_GRACE_MS",
            DEFAULT_SHUTDOWN_GRACE_MS,
        ));

        let log_filter = env("COLLABORNEST_GATEWAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = env("COLLABORNEST_GATEWAY_LOG_FORMAT")
            .ok()
            .and_then(|value| LogFormat::parse(&value))
            .unwrap_or_default();

        Self {
            listen_addr,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            max_connections_per_user,
            heartbeat,
            shutdown_grace,
            log_filter,
            log_format,
        }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

fn positive_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr + PartialEq + Default + Copy,
{
    let value = parse_or(env, key, default);
    if value == T::default() {
        default
    } else {
        value
    }
}
