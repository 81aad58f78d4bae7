//! Startup configuration
//!
//! Read once from `<config dir>/mqtt-console/config.toml` (or a path given on
//! the command line). A missing file means built-in defaults. Nothing is
//! ever written back.
//!
//! ```toml
//! [connection]
//! broker_url = "mqtts://broker.example:8883"
//! client_id = "bench-01"
//! protocol = "5.0"
//! keep_alive_secs = 60
//!
//! [connection.credentials]
//! username = "bench"
//! password = "secret"
//!
//! [publish]
//! topic = "$dp"
//! mode = "text"
//!
//! [[subscriptions]]
//! topic = "devices/#"
//! qos = 1
//! ```

use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::mqtt::codec::PayloadMode;
use crate::mqtt::config::{ConnectionConfig, QoS};
use crate::mqtt::subscriptions::Subscription;

const APP_DIR: &str = "mqtt-console";
const CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_PUBLISH_TOPIC: &str = "$test";

/// Defaults applied to `pub` commands that omit an option
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PublishDefaults {
    pub topic: String,
    pub mode: PayloadMode,
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishDefaults {
    fn default() -> Self {
        Self {
            topic: DEFAULT_PUBLISH_TOPIC.to_string(),
            mode: PayloadMode::Json,
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub publish: PublishDefaults,
    /// Registered before the first connect
    pub subscriptions: Vec<Subscription>,
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Invalid configuration: {}", e))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_toml_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Loads `path` if given, otherwise the default location if it exists,
    /// otherwise the built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }
}
