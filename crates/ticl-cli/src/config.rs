//! CLI configuration
//!
//! A TOML file with a `[client]` table holding the [`ClientConfig`] and a
//! `[simulation]` table for the loopback run. Every field is optional and
//! falls back to its default.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ticl_core::{ApplicationClientId, ClientConfig};

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub client: ClientConfig,
    pub simulation: SimulationConfig,
}

/// Settings for `ticl simulate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub client_type: i32,
    pub client_name: String,
    /// Source of the simulated object ids
    pub object_source: i32,
    /// Directory for the persisted session token; kept in memory when unset
    pub state_dir: Option<PathBuf>,
    /// Give up if the run has not finished after this long
    pub timeout_secs: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            client_type: 4,
            client_name: "ticl-cli".to_string(),
            object_source: 4,
            state_dir: None,
            timeout_secs: 30,
        }
    }
}

impl SimulationConfig {
    pub fn client_id(&self) -> ApplicationClientId {
        ApplicationClientId::new(self.client_type, self.client_name.as_bytes())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CliConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.client.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
