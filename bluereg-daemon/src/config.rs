use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
    pub bluetooth: BluetoothConfig,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Talk to BlueZ on the session bus instead of the system bus.
    pub session_bus: bool,
    /// MAC, hciN name or object path of the adapter to use by default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_adapter: Option<String>,
    pub scan_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/bluereg/bluereg.sock".to_string(),
            bluetooth: BluetoothConfig::default(),
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            session_bus: false,
            default_adapter: None,
            scan_timeout_ms: 5000,
        }
    }
}

impl DaemonConfig {
    pub fn load(path: &str) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(_) => {
                // Create default config if not found
                let config = Self::default();
                if let Err(e) = write_default(path, &config) {
                    warn!("Could not write default config to {}: {}", path, e);
                }
                Ok(config)
            }
        }
    }
}

fn write_default(path: &str, config: &DaemonConfig) -> Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, toml::to_string_pretty(config)?)?;
    Ok(())
}
