//! Facade configuration
//!
//! Loaded from a JSON or TOML file, then overridden by environment variables.

use persistence_worker::{
    ChannelConfig, StdioConfig, StorageTarget, WorkerChannel, WorkerInit, WorkerTunables,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const ENV_STORE_DIR: &str = "CHAT_STORE_DIR";
pub const ENV_STORE_SQLITE: &str = "CHAT_STORE_SQLITE";
pub const ENV_RPC_TIMEOUT_MS: &str = "CHAT_RPC_TIMEOUT_MS";
pub const ENV_RPC_MAX_PENDING: &str = "CHAT_RPC_MAX_PENDING";
pub const ENV_AUTOSAVE: &str = "CHAT_AUTOSAVE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_storage")]
    pub storage: StorageTarget,
    /// SQL run once after a SQLite store is opened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<String>,
    #[serde(default)]
    pub tunables: WorkerTunables,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub autosave: AutosaveConfig,
    #[serde(default)]
    pub worker: WorkerLaunch,
}

/// How the worker is hosted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum WorkerLaunch {
    /// Dedicated thread in this process
    #[default]
    Thread,
    /// Child process running the `persistence-worker` binary
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutosaveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Quiet period after the last change before flushing
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    /// Periodic flush, picks up anything a failed flush left dirty
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: default_debounce(),
            interval_ms: default_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_debounce() -> u64 {
    1000
}

fn default_interval() -> u64 {
    30000
}

fn default_storage() -> StorageTarget {
    StorageTarget::Directory {
        path: default_data_dir().join("conversations"),
    }
}

/// Per-user data directory for conversation storage.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chat-persistence")
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            storage: default_storage(),
            setup_script: None,
            tunables: WorkerTunables::default(),
            channel: ChannelConfig::default(),
            autosave: AutosaveConfig::default(),
            worker: WorkerLaunch::default(),
        }
    }
}

impl PersistenceConfig {
    /// Read `path` (`.toml` or JSON), fall back to defaults when it is missing
    /// or unreadable, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let mut config = Self::from_file(path.as_ref()).unwrap_or_default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read persistence config");
                return None;
            }
        };

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);
        let parsed = if is_toml {
            toml::from_str::<Self>(&content).map_err(|e| e.to_string())
        } else {
            serde_json::from_str::<Self>(&content).map_err(|e| e.to_string())
        };

        match parsed {
            Ok(config) => {
                info!(path = %path.display(), "Loaded persistence config");
                Some(config)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring invalid persistence config");
                None
            }
        }
    }

    /// Layer overrides from `lookup` (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_STORE_DIR) {
            self.storage = StorageTarget::Directory { path: dir.into() };
        }
        // SQLite wins when both are set.
        if let Some(db) = lookup(ENV_STORE_SQLITE) {
            self.storage = StorageTarget::Sqlite { path: db.into() };
        }
        if let Some(value) = lookup(ENV_RPC_TIMEOUT_MS) {
            match value.trim().parse() {
                Ok(ms) => self.channel.request_timeout_ms = ms,
                Err(_) => warn!(value = %value, "Ignoring invalid {}", ENV_RPC_TIMEOUT_MS),
            }
        }
        if let Some(value) = lookup(ENV_RPC_MAX_PENDING) {
            match value.trim().parse() {
                Ok(limit) => self.channel.max_pending = limit,
                Err(_) => warn!(value = %value, "Ignoring invalid {}", ENV_RPC_MAX_PENDING),
            }
        }
        if let Some(value) = lookup(ENV_AUTOSAVE) {
            self.autosave.enabled = parse_bool_env(&value);
        }
    }

    pub fn worker_init(&self) -> WorkerInit {
        WorkerInit {
            storage: self.storage.clone(),
            setup_script: self.setup_script.clone(),
            tunables: self.tunables.clone(),
        }
    }

    /// Channel for this configuration, not yet started.
    pub fn build_channel(&self) -> WorkerChannel {
        let init = self.worker_init();
        match &self.worker {
            WorkerLaunch::Thread => WorkerChannel::thread(self.channel.clone(), init),
            WorkerLaunch::Process { command, args } => {
                let mut process = StdioConfig::new(command.clone());
                process.args = args.clone();
                WorkerChannel::process(self.channel.clone(), init, process)
            }
        }
    }
}
