//! Client configuration and manager discovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::{API_VERSION_MAJOR, API_VERSION_MINOR};

/// Environment variable through which a manager passes its endpoint.
pub const NSM_URL_VAR: &str = "NSM_URL";

const CONFIG_FILE: &str = "config.json";

/// Endpoint advertised by the manager that launched this process, if any.
#[must_use]
pub fn nsm_url_from_env() -> Option<String> {
    std::env::var(NSM_URL_VAR)
        .ok()
        .filter(|url| !url.trim().is_empty())
}

/// Persistent client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Name shown by the manager; defaults to the process name.
    #[serde(default)]
    pub pretty_name: Option<String>,

    /// Capability tokens, e.g. `["dirty", "optional-gui"]`.
    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(default = "default_announce_timeout")]
    pub announce_timeout_ms: u64,

    #[serde(default = "default_api_major")]
    pub api_major: i32,

    #[serde(default = "default_api_minor")]
    pub api_minor: i32,

    /// How long each host poll waits for an event.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_announce_timeout() -> u64 {
    100_000
}
fn default_api_major() -> i32 {
    API_VERSION_MAJOR
}
fn default_api_minor() -> i32 {
    API_VERSION_MINOR
}
fn default_poll_interval() -> u64 {
    100
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            pretty_name: None,
            capabilities: Vec::new(),
            announce_timeout_ms: default_announce_timeout(),
            api_major: default_api_major(),
            api_minor: default_api_minor(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl ClientConfig {
    /// Load config from file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains invalid JSON.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save config to file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `~/.config/<app>/config.json` on Linux.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no home directory can be determined.
    pub fn default_path(app: &str) -> Result<PathBuf> {
        let project = ProjectDirs::from("", "", app).ok_or_else(|| {
            Error::Config(format!("cannot determine config directory for {app:?}"))
        })?;
        Ok(project.config_dir().join(CONFIG_FILE))
    }

    #[must_use]
    pub const fn announce_timeout(&self) -> Duration {
        Duration::from_millis(self.announce_timeout_ms)
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
