use anyhow::{Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::handshake::HandshakeOptions;
use crate::transfer::TransferEngine;
use crate::transfer::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_LOW_WATER_MARK, MAX_CHUNK_SIZE};

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "handoff";
const APP_NAME: &str = "handoff";
const CONFIG_FILE: &str = "config.json";

/// Overrides the config directory (tests, portable installs)
pub const CONFIG_DIR_ENV: &str = "HANDOFF_CONFIG_DIR";

/// Settings for one peer process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// WebSocket URL of the signaling server, e.g. `ws://127.0.0.1:3030/ws`
    pub signaling_url: String,
    pub download_dir: PathBuf,
    pub chunk_size: u32,
    pub low_water_mark: u64,
    pub handshake_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Local address of the direct-channel listener when sending
    pub quic_bind_addr: SocketAddr,
}

impl Default for PeerConfig {
    fn default() -> Self {
        let download_dir = directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("handoff");

        Self {
            signaling_url: "ws://127.0.0.1:3030/ws".to_string(),
            download_dir,
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            handshake_timeout_secs: 30,
            connect_timeout_secs: 5,
            quic_bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }
}

impl PeerConfig {
    fn get_config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from disk, falling back to defaults for anything missing
    pub fn load() -> Self {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = Self::get_config_path() else {
            bail!("no config directory available on this platform");
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.signaling_url)?;
        if !matches!(url.scheme(), "ws" | "wss") {
            bail!("signaling URL must use ws:// or wss://, got {}", url.scheme());
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "chunk_size must be between 1 and {} bytes",
                MAX_CHUNK_SIZE
            );
        }
        if self.handshake_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }
        Ok(())
    }

    pub fn handshake_options(&self) -> HandshakeOptions {
        HandshakeOptions {
            bind_addr: self.quic_bind_addr,
            timeout: Duration::from_secs(self.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }

    pub fn transfer_engine(&self) -> TransferEngine {
        TransferEngine {
            chunk_size: self.chunk_size,
            low_water_mark: self.low_water_mark,
        }
    }
}
