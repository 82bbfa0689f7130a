//! Transport configuration
//!
//! Every period and timeout the subsystem uses lives here; call sites never
//! hard-code them. Settings load from a TOML file and fall back to defaults
//! when the file is missing or malformed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dprobe_core::prelude::*;

/// Default poll period for the event poller.
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default bounded wait for the attach handshake.
const DEFAULT_ATTACH_TIMEOUT_MS: u64 = 5_000;

/// Default minimum device API level eligible for inspection.
const DEFAULT_MIN_API_LEVEL: u32 = 29;

/// Tunables for the transport subsystem.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TransportConfig {
    /// Poll period of the event poller, in milliseconds.
    pub poll_interval_ms: u64,

    /// How long `attach` waits for the agent to acknowledge before surfacing
    /// a timeout error, in milliseconds.
    pub attach_timeout_ms: u64,

    /// Device streams below this API level are not eligible for inspection.
    pub min_api_level: u32,

    /// Path to the agent configuration handed to the agent on attach.
    /// Content and format are owned by the surrounding system.
    pub agent_config_path: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            attach_timeout_ms: DEFAULT_ATTACH_TIMEOUT_MS,
            min_api_level: DEFAULT_MIN_API_LEVEL,
            agent_config_path: PathBuf::from("agent.config"),
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    /// Load configuration from a TOML file.
    ///
    /// Returns defaults if the file doesn't exist or can't be parsed.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(config) => {
                debug!("Loaded transport config from {:?}", path);
                config
            }
            Err(Error::ConfigNotFound { .. }) => {
                debug!("No config file at {:?}, using defaults", path);
                Self::default()
            }
            Err(e) => {
                warn!("Ignoring transport config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Load configuration from a TOML file, surfacing every failure.
    ///
    /// For callers that treat a broken config as an error rather than
    /// silently running with defaults.
    pub fn try_load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))
    }
}
