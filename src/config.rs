use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A monitored host and the parameters needed to reach its agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTarget {
    /// Stable, unique identifier
    pub id: String,

    /// Display name (falls back to `address:port`)
    #[serde(default)]
    pub name: Option<String>,

    pub address: String,

    #[serde(default = "crate::util::get_default_port")]
    pub port: u16,

    /// Shared secret sent to the agent during the handshake
    #[serde(alias = "password")]
    pub secret: String,

    /// Use `wss://` instead of `ws://`
    #[serde(default)]
    pub secure: bool,
}

impl HostTarget {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            address: address.into(),
            port,
            secret: secret.into(),
            secure: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// WebSocket endpoint of the agent
    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/ws", self.address, self.port)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.address, self.port))
    }

    /// Whether switching from `self` to `other` requires a new handshake
    pub fn endpoint_differs(&self, other: &HostTarget) -> bool {
        self.address != other.address
            || self.port != other.port
            || self.secret != other.secret
            || self.secure != other.secure
    }
}

/// Tuning knobs for the connection layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Fixed delay before a reconnect attempt, at least 1 (default: 5)
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Time allowed for opening a transport, at least 1 (default: 10)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Capacity of the snapshot and message broadcast channels (default: 256)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Capacity of each actor's command channel (default: 32)
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    /// Time to wait for a history response before live points resume (default: 15)
    #[serde(default = "default_history_timeout_secs")]
    pub history_timeout_secs: u64,

    /// Interval of the status summary printed by the binary (default: 10)
    #[serde(default = "default_summary_interval_secs")]
    pub summary_interval_secs: u64,

    /// JSON file holding the configured hosts
    #[serde(default)]
    pub hosts_file: Option<PathBuf>,
}

fn default_reconnect_delay_secs() -> u64 {
    crate::util::get_reconnect_delay().as_secs()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_event_capacity() -> usize {
    256
}

fn default_command_capacity() -> usize {
    32
}

fn default_history_timeout_secs() -> u64 {
    15
}

fn default_summary_interval_secs() -> u64 {
    10
}

impl LinkConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_secs(self.history_timeout_secs)
    }

    /// Load configuration from file, or use defaults if no file exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(|p| p.to_path_buf()).or_else(|| {
            let default_path = dirs::config_dir()?.join("hostwatch/config.toml");
            default_path.exists().then_some(default_path)
        });

        let Some(path) = config_path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str::<Self>(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
            .inspect(|config| trace!("loaded config: {config:?}"))
    }

    /// Location of the host list, defaulting to the user data directory
    pub fn hosts_path(&self) -> PathBuf {
        self.hosts_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("hostwatch")
                .join("hosts.json")
        })
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
            history_timeout_secs: default_history_timeout_secs(),
            summary_interval_secs: default_summary_interval_secs(),
            hosts_file: None,
        }
    }
}
