//! TOML configuration.
//!
//! Every field has a default so an empty (or missing) config file yields a
//! working client pointed at a local relay. The file lives at the platform
//! config dir (`partymap/config.toml`) unless an explicit path is given.

use crate::error::{Error, Result};
use crate::store::DEFAULT_RETENTION_MS;
use crate::transport::BackoffPolicy;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_relay_url() -> String {
    "ws://127.0.0.1:9777".to_string()
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_retention_days() -> u32 {
    30
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Websocket URL of the relay.
    pub relay_url: String,
    /// Where the pin database lives; platform data dir when unset.
    pub data_dir: Option<PathBuf>,
    /// Active identity stamped on created pins.
    pub author: Option<String>,
    /// Coalescing window for outgoing snapshots.
    pub debounce_ms: u64,
    /// How long deleted pins are kept as tombstones.
    pub retention_days: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            data_dir: None,
            author: None,
            debounce_ms: default_debounce_ms(),
            retention_days: default_retention_days(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
        }
    }
}

impl Config {
    /// Load from an explicit path, or from the platform config dir. A
    /// missing file is not an error; defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match project_dirs() {
                Some(dirs) => dirs.config_dir().join("config.toml"),
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.relay_url.is_empty() {
            return Err(Error::Config("relay_url must not be empty".into()));
        }
        if self.backoff_base_ms == 0 {
            return Err(Error::Config("backoff_base_ms must be positive".into()));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(Error::Config(
                "backoff_cap_ms must be at least backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    /// Path of the pin database, creating the parent directory if needed.
    pub fn db_path(&self) -> Result<PathBuf> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => project_dirs()
                .map(|dirs| dirs.data_dir().to_path_buf())
                .ok_or_else(|| Error::Config("cannot determine a data directory".into()))?,
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join("pins.db"))
    }

    pub fn retention_ms(&self) -> i64 {
        if self.retention_days == 0 {
            return DEFAULT_RETENTION_MS;
        }
        i64::from(self.retention_days) * 24 * 3600 * 1000
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "partymap", "partymap")
}
