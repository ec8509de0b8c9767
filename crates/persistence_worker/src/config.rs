use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Caller-side channel behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Default per-call timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// How long `start` waits for the worker's ready signal
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,
    /// Outstanding calls allowed before new calls are rejected
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Crash recovery
    #[serde(default)]
    pub restart: RestartConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            startup_timeout_ms: default_startup_timeout(),
            max_pending: default_max_pending(),
            restart: RestartConfig::default(),
        }
    }
}

fn default_request_timeout() -> u64 {
    15000 // 15 seconds
}

fn default_startup_timeout() -> u64 {
    10000 // 10 seconds
}

fn default_max_pending() -> usize {
    256
}

/// Restart configuration after an unexpected worker exit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Failed restart attempts allowed for one crash before giving up. The
    /// count resets once a restarted worker is online again.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RestartConfig {
    /// Delay before restart attempt `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30000
}

fn default_max_attempts() -> u32 {
    5
}

/// Where the worker keeps conversations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageTarget {
    #[default]
    Memory,
    Directory { path: PathBuf },
    Sqlite { path: PathBuf },
}

impl std::fmt::Display for StorageTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageTarget::Memory => write!(f, "memory"),
            StorageTarget::Directory { path } => write!(f, "directory:{}", path.display()),
            StorageTarget::Sqlite { path } => write!(f, "sqlite:{}", path.display()),
        }
    }
}

/// Worker-side knobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTunables {
    /// Largest accepted `save` payload, in bytes of encoded tree
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
    /// Requests slower than this are logged as warnings
    #[serde(default = "default_slow_request")]
    pub slow_request_ms: u64,
    /// SQLite busy timeout
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for WorkerTunables {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload(),
            slow_request_ms: default_slow_request(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_max_payload() -> usize {
    32 * 1024 * 1024
}

fn default_slow_request() -> u64 {
    500
}

fn default_busy_timeout() -> u64 {
    5000
}

/// Initialization parameters handed to the worker on start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerInit {
    #[serde(default)]
    pub storage: StorageTarget,
    /// SQL run once after the database is opened
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_script: Option<String>,
    #[serde(default)]
    pub tunables: WorkerTunables,
}

impl WorkerInit {
    pub fn new(storage: StorageTarget) -> Self {
        Self {
            storage,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let restart = RestartConfig {
            enabled: true,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            max_attempts: 10,
        };
        assert_eq!(restart.backoff_ms(1), 100);
        assert_eq!(restart.backoff_ms(2), 200);
        assert_eq!(restart.backoff_ms(4), 800);
        assert_eq!(restart.backoff_ms(5), 1000);
        assert_eq!(restart.backoff_ms(60), 1000);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ChannelConfig = serde_json::from_str(r#"{"max_pending": 4}"#).unwrap();
        assert_eq!(config.max_pending, 4);
        assert_eq!(config.request_timeout_ms, 15000);
        assert!(config.restart.enabled);
    }

    #[test]
    fn test_storage_defaults_to_memory() {
        assert_eq!(StorageTarget::default(), StorageTarget::Memory);
        let init: WorkerInit = serde_json::from_str("{}").unwrap();
        assert_eq!(init.storage, StorageTarget::Memory);
    }

    #[test]
    fn test_storage_target_shape() {
        let init: WorkerInit = serde_json::from_str(
            r#"{"storage": {"type": "sqlite", "path": "/tmp/chats.db"}}"#,
        )
        .unwrap();
        assert_eq!(
            init.storage,
            StorageTarget::Sqlite {
                path: PathBuf::from("/tmp/chats.db")
            }
        );
        assert_eq!(init.tunables, WorkerTunables::default());
    }
}
