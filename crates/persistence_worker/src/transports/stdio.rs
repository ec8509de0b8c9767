use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WorkerTransport;
use crate::config::WorkerInit;
use crate::error::{ChannelError, Result};
use crate::types::WorkerEvent;

/// Child-process worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Worker executable
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Grace period for a clean exit before the process is killed
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_shutdown_grace() -> u64 {
    5000
}

impl StdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

struct RunningProcess {
    stdin: Option<ChildStdin>,
    kill: CancellationToken,
    exited: Option<oneshot::Receiver<()>>,
}

/// Runs the worker as a child process speaking newline-delimited JSON
pub struct StdioTransport {
    config: StdioConfig,
    process: Mutex<Option<RunningProcess>>,
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            process: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WorkerTransport for StdioTransport {
    async fn spawn(&self, init: &WorkerInit) -> Result<mpsc::UnboundedReceiver<WorkerEvent>> {
        let mut process = self.process.lock().await;
        if process.is_some() {
            return Err(ChannelError::Transport("worker process already running".into()));
        }

        info!(
            command = %self.config.command,
            args = ?self.config.args,
            "Starting persistence worker process"
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        if !self.config.env.is_empty() {
            cmd.envs(&self.config.env);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn persistence worker: {}", e);
            ChannelError::Transport(format!("Failed to spawn process: {}", e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChannelError::Transport("Failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::Transport("Failed to capture stdout".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[persistence worker stderr] {}", line);
                }
            });
        }

        let init_line = format!("{}\n", serde_json::to_string(init)?);
        stdin.write_all(init_line.as_bytes()).await?;
        stdin.flush().await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exited_tx, exited_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        let kill_signal = kill.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if !line.is_empty() {
                                let _ = event_tx.send(WorkerEvent::Message(line.to_string()));
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Failed to read worker stdout: {}", e);
                            break;
                        }
                    },
                    _ = kill_signal.cancelled() => break,
                }
            }

            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let event = match status {
                Ok(status) => WorkerEvent::Exited {
                    code: status.code(),
                    reason: format!("worker process exited: {}", status),
                },
                Err(e) => WorkerEvent::Exited {
                    code: None,
                    reason: format!("failed to wait for worker process: {}", e),
                },
            };
            let _ = event_tx.send(event);
            let _ = exited_tx.send(());
        });

        *process = Some(RunningProcess {
            stdin: Some(stdin),
            kill,
            exited: Some(exited_rx),
        });
        Ok(event_rx)
    }

    async fn send(&self, message: String) -> Result<()> {
        let mut process = self.process.lock().await;
        let stdin = process
            .as_mut()
            .and_then(|p| p.stdin.as_mut())
            .ok_or(ChannelError::NotStarted)?;

        let line = format!("{}\n", message);
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to write: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to flush: {}", e)))?;
        Ok(())
    }

    async fn terminate(&self) -> Result<()> {
        let Some(mut process) = self.process.lock().await.take() else {
            return Ok(());
        };
        info!("Stopping persistence worker process");

        // EOF on stdin asks the worker to finish and exit.
        process.stdin = None;
        let Some(mut exited) = process.exited.take() else {
            return Ok(());
        };

        let grace = tokio::time::Duration::from_millis(self.config.shutdown_grace_ms);
        match tokio::time::timeout(grace, &mut exited).await {
            Ok(_) => info!("Persistence worker exited gracefully"),
            Err(_) => {
                warn!("Persistence worker did not exit gracefully, killing");
                process.kill.cancel();
                let _ = exited.await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_executable_fails_to_spawn() {
        let transport = StdioTransport::new(StdioConfig::new("/nonexistent/persistence-worker"));
        let result = transport.spawn(&WorkerInit::default()).await;
        assert!(matches!(result, Err(ChannelError::Transport(_))));
    }

    #[test]
    fn test_config_defaults() {
        let config: StdioConfig = serde_json::from_str(r#"{"command": "persistence-worker"}"#).unwrap();
        assert_eq!(config.shutdown_grace_ms, 5000);
        assert!(config.args.is_empty());
    }
}
