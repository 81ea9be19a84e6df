use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DeviceError, DeviceResult};

pub const HOST_ENV: &str = "HORUS_HOST";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub connection: ConnectionConfig,
    pub peers: PeerConfig,
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub http_port: u16,
    pub ws_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub reconnect_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

/// How a peer's identifier becomes an address: `<scheme>://<id><host_suffix>[:port]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub scheme: String,
    pub host_suffix: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub ota_message_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "horus.local".to_string(),
            http_port: 80,
            ws_port: 81,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: 5,
            connect_timeout_secs: 5,
            request_timeout_secs: 15,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host_suffix: ".local".to_string(),
            port: None,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { ota_message_secs: 5 }
    }
}

impl DeviceConfig {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.ws_port)
    }

    pub fn http_base(&self) -> String {
        if self.http_port == 80 {
            format!("http://{}", self.host)
        } else {
            format!("http://{}:{}", self.host, self.http_port)
        }
    }
}

impl ConnectionConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

impl DisplayConfig {
    pub fn ota_message_window(&self) -> Duration {
        Duration::from_secs(self.ota_message_secs)
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        if let Some(proj_dirs) = ProjectDirs::from("com", "horus", "horus") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            PathBuf::from("config/horus.toml")
        }
    }

    pub fn load(path: &Path) -> DeviceResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DeviceError::Config(format!("{}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| DeviceError::Config(format!("{}: {e}", path.display())))
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                if path.exists() {
                    tracing::warn!("Ignoring unreadable config: {}", e);
                }
                Self::default()
            }
        }
    }

    /// Applies `HORUS_HOST` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var(HOST_ENV) {
            let host = host.trim();
            if !host.is_empty() {
                self.device.host = host.to_string();
            }
        }
        self
    }
}
