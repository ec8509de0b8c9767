use serde::{Deserialize, Serialize};

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Stopped,
    Starting,
    Online,
    Stopping,
    Crashed,
    Restarting,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Stopped => write!(f, "stopped"),
            ChannelState::Starting => write!(f, "starting"),
            ChannelState::Online => write!(f, "online"),
            ChannelState::Stopping => write!(f, "stopping"),
            ChannelState::Crashed => write!(f, "crashed"),
            ChannelState::Restarting => write!(f, "restarting"),
        }
    }
}

/// Point-in-time health of a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub state: ChannelState,
    pub pending_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_pending_age_ms: Option<u64>,
    /// Restart attempts for the current crash; zero once the worker is back online
    pub restart_attempts: u32,
    /// Successful worker starts over the channel's lifetime
    pub worker_starts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<String>,
}

/// Something a transport observed about its worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// One outbound line (response or signal)
    Message(String),
    /// The worker is gone. `code` is `None` when killed by a signal.
    Exited { code: Option<i32>, reason: String },
}
