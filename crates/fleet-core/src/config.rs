//! fleetd.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub locks: LockSection,
    #[serde(default)]
    pub update: UpdateSection,
    #[serde(default)]
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSection {
    /// redb database file.
    pub path: PathBuf,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/fleetgrid/state.redb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Per-attempt timeout for agent calls.
    pub timeout_ms: u64,
    /// Extra attempts after a timed-out call.
    pub retries: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub expiry_ms: u64,
    pub poll_interval_ms: u64,
    pub deployment_timeout_ms: u64,
    pub network_timeout_ms: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            expiry_ms: 60_000,
            poll_interval_ms: 500,
            deployment_timeout_ms: 10_000,
            network_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSection {
    /// How often the watch step polls agent state.
    pub watch_poll_interval_ms: u64,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            watch_poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl AgentSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl LockSection {
    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_millis(self.deployment_timeout_ms)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }
}

impl UpdateSection {
    pub fn watch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch_poll_interval_ms)
    }
}
