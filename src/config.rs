//! Configuration loading and management
//!
//! Handles parsing of `config.toml` from the user's config directory (or an
//! explicit `--config` path).
//!
//! ```toml
//! [hub]
//! url = "https://hub.example.com"
//! token = "..."
//! timeout_secs = 30
//! device_id = "laptop-1"
//!
//! [sync]
//! max_attempts = 20
//!
//! [[projects]]
//! id = "web"
//! path = "/home/me/src/web"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.toml";
const QUEUE_FILE: &str = "sync-queue.json";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Hub connection settings
    #[serde(default)]
    pub hub: HubConfig,

    /// Durable queue settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Registered local projects
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

/// Hub connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Base URL of the Hub, e.g. `https://hub.example.com`
    #[serde(default)]
    pub url: Option<String>,

    /// Bearer token
    #[serde(default)]
    pub token: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Identity of this device for registration and heartbeats
    #[serde(default)]
    pub device_id: Option<String>,
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            timeout_secs: default_timeout_secs(),
            device_id: None,
        }
    }
}

impl HubConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether both the URL and the token are present
    pub fn is_configured(&self) -> bool {
        non_empty(self.url.as_deref()).is_some() && non_empty(self.token.as_deref()).is_some()
    }
}

/// Durable queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    /// Override for the queue file location
    #[serde(default)]
    pub queue_file: Option<PathBuf>,

    /// Move a mutation to the dead-letter file after this many failed
    /// attempts. Unset retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

/// A project whose tasks live under `<path>/.tasks/specs`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    pub id: String,
    pub path: PathBuf,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "hubsync", "hubsync")
}

/// Default location of `config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

/// Per-user data directory holding the durable queue
pub fn default_data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

impl Config {
    /// Load configuration from a `config.toml` file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration if the file exists, or return defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        crate::lock::write_atomic(path, content.as_bytes())
    }

    /// Resolve the queue file: explicit override, then `data_dir`, then the
    /// per-user data directory.
    pub fn queue_file(&self, data_dir: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = &self.sync.queue_file {
            return Ok(path.clone());
        }
        if let Some(dir) = data_dir {
            return Ok(dir.join(QUEUE_FILE));
        }
        default_data_dir()
            .map(|dir| dir.join(QUEUE_FILE))
            .ok_or_else(|| {
                Error::InvalidConfig("cannot determine a user data directory".to_string())
            })
    }

    pub fn validate(&self) -> Result<()> {
        self.hub.validate()?;
        if let Some(0) = self.sync.max_attempts {
            return Err(Error::InvalidConfig(
                "sync.max_attempts must be >= 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for project in &self.projects {
            let id = project.id.trim();
            if id.is_empty() {
                return Err(Error::InvalidConfig(
                    "projects.id cannot be empty".to_string(),
                ));
            }
            if id.contains('/') || id.contains('\\') {
                return Err(Error::InvalidConfig(format!(
                    "projects.id '{id}' cannot contain path separators"
                )));
            }
            if !seen.insert(id) {
                return Err(Error::InvalidConfig(format!(
                    "projects.id '{id}' is registered twice"
                )));
            }
        }
        Ok(())
    }
}

impl HubConfig {
    fn validate(&self) -> Result<()> {
        if let Some(url) = non_empty(self.url.as_deref()) {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(Error::InvalidConfig(format!(
                    "hub.url must start with http:// or https:// (got '{url}')"
                )));
            }
        }
        if self.timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "hub.timeout_secs must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}
