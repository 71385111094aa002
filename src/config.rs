// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::DEFAULT_READ_BUFFER_SIZE;

/// Directory name under the user's config directory.
const APP_DIR: &str = "btserial";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// Client mode settings.
    pub client: ClientConfig,

    /// Server mode settings.
    pub server: ServerConfig,

    /// Connection tuning.
    pub link: LinkConfig,
}

/// Which side of the link to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Client,
    Server,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    pub mode: Mode,

    /// RFCOMM channel to connect to or listen on.
    pub channel: u8,

    /// Alias set on the local adapter in server mode.
    pub adapter_alias: Option<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Server,
            channel: 1,
            adapter_alias: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Remote device address, e.g. "00:11:22:33:44:55".
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Service class UUID: 16-bit, 32-bit or 128-bit form.
    pub uuid: String,

    /// Advertised service name. Empty picks a name from the UUID.
    pub service_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            uuid: "1101".to_string(),
            service_name: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Upper bound of a single read in bytes.
    pub read_buffer_size: usize,

    /// How often the accept loop checks whether it was stopped.
    pub accept_poll_interval_us: u64,

    /// Pause after a failed accept before trying again.
    pub accept_retry_delay_ms: u64,

    /// Capacity of the server event channel.
    pub event_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            accept_poll_interval_us: 333,
            accept_retry_delay_ms: 1000,
            event_buffer: 32,
        }
    }
}

impl LinkConfig {
    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_micros(self.accept_poll_interval_us.max(1))
    }

    pub fn accept_retry_delay(&self) -> Duration {
        Duration::from_millis(self.accept_retry_delay_ms)
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from the default file or create it with defaults.
    pub fn load() -> Result<Self> {
        Self::load_or_create(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if it is missing.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::from_path(path);
        }

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let config = Self::default();
        config.save_to(path)?;
        Ok(config)
    }

    /// Load configuration from an existing file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
