//! Hub and bridge configuration
//!
//! Both structs deserialize from camelCase JSON with defaults for every field,
//! so a partial config file is enough.

use crate::error::{HubError, Result};
use crate::types::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Local hub settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Hub name used in logs and by `FlowHub::name`
    #[serde(default = "default_name")]
    pub name: String,

    /// Capacity of each subscription channel (default: 1024)
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Directory holding `<topic>.flow` logs; required for durable topics
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Cursor journal; defaults to `<data_dir>/cursors.jsonl`, in-memory without a data dir
    #[serde(default)]
    pub cursor_file: Option<PathBuf>,

    /// Durability of topics created implicitly by publish/subscribe
    ///
    /// Off unless set; turning it on requires `data_dir`.
    #[serde(default)]
    pub default_durable: bool,

    /// What to do with a subscriber whose delivery failed
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Flush and sync the topic log after every publish
    #[serde(default)]
    pub flush_on_publish: bool,
}

fn default_name() -> String {
    "local".to_string()
}

fn default_buffer_size() -> usize {
    1024
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            buffer_size: default_buffer_size(),
            data_dir: None,
            cursor_file: None,
            default_durable: false,
            failure_policy: FailurePolicy::default(),
            flush_on_publish: false,
        }
    }
}

impl HubConfig {
    /// In-memory hub: no data dir, topics are not durable
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_durable: false,
            ..Default::default()
        }
    }

    /// Durable hub rooted at `data_dir`
    pub fn durable(name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            data_dir: Some(data_dir.into()),
            default_durable: true,
            ..Default::default()
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Check field consistency
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HubError::Config("Hub name must not be empty".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(HubError::Config(
                "bufferSize must be greater than zero".to_string(),
            ));
        }
        if self.default_durable && self.data_dir.is_none() {
            return Err(HubError::Config(
                "defaultDurable requires a dataDir".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the flow log for `topic`, if the hub has a data dir
    pub fn topic_path(&self, topic: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.flow", topic)))
    }

    /// Effective cursor file location
    pub fn cursor_path(&self) -> Option<PathBuf> {
        self.cursor_file
            .clone()
            .or_else(|| self.data_dir.as_ref().map(|dir| dir.join("cursors.jsonl")))
    }
}

/// Remote bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// Address the bridge server listens on (e.g. "0.0.0.0:7070")
    #[serde(default)]
    pub listen: Option<String>,

    /// Address of the peer hub to pull topics from
    #[serde(default)]
    pub remote: Option<String>,

    /// Dial timeout in seconds (default: 5)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Graceful shutdown bound for the server in seconds (default: 5)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen: None,
            remote: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl RemoteConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.is_none() && self.remote.is_none() {
            return Err(HubError::Config(
                "Either listen or remote must be set".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(HubError::Config(
                "connectTimeoutSecs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HubError::Config(format!(
            "Failed to read config file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(serde_json::from_str(&content)?)
}
