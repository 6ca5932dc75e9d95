//! Server settings, read from the environment (and `.env` when present).

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Signaling server configuration
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub host: String,
    pub port: u16,
    /// How long a room waits for a receiver before it is reaped
    pub idle_timeout: Duration,
    /// Bound on delivering one relayed message to the other peer
    pub relay_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_rooms: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            idle_timeout: Duration::from_secs(300),
            relay_timeout: Duration::from_millis(2000),
            sweep_interval: Duration::from_secs(60),
            max_rooms: 10_000,
        }
    }
}

impl SignalConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            host: env::var("SIGNAL_HOST").unwrap_or(defaults.host),
            port: env_or("SIGNAL_PORT", defaults.port),
            idle_timeout: Duration::from_secs(env_or(
                "SIGNAL_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )),
            relay_timeout: Duration::from_millis(env_or(
                "SIGNAL_RELAY_TIMEOUT_MS",
                defaults.relay_timeout.as_millis() as u64,
            )),
            sweep_interval: Duration::from_secs(
                env_or(
                    "SIGNAL_SWEEP_INTERVAL_SECS",
                    defaults.sweep_interval.as_secs(),
                )
                .max(1),
            ),
            max_rooms: env_or("SIGNAL_MAX_ROOMS", defaults.max_rooms),
        }
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}: {}", addr, e))
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}
