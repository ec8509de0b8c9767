use async_trait::async_trait;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::WorkerTransport;
use crate::config::WorkerInit;
use crate::error::{ChannelError, Result};
use crate::types::WorkerEvent;
use crate::worker;

/// Exit code reported when the worker thread panics
pub const PANIC_EXIT_CODE: i32 = 101;

struct RunningThread {
    requests: std_mpsc::Sender<String>,
    handle: JoinHandle<()>,
}

/// Runs the worker on a dedicated OS thread inside this process
#[derive(Default)]
pub struct ThreadTransport {
    running: Mutex<Option<RunningThread>>,
}

impl ThreadTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkerTransport for ThreadTransport {
    async fn spawn(&self, init: &WorkerInit) -> Result<mpsc::UnboundedReceiver<WorkerEvent>> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ChannelError::Transport("worker thread already running".into()));
        }

        let (request_tx, request_rx) = std_mpsc::channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let init = init.clone();

        info!(storage = %init.storage, "Starting persistence worker thread");
        let handle = std::thread::Builder::new()
            .name("persistence-worker".to_owned())
            .spawn(move || {
                let lines = event_tx.clone();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    worker::serve(&init, request_rx.iter(), |line| {
                        let _ = lines.send(WorkerEvent::Message(line));
                    })
                }));

                let (code, reason) = match outcome {
                    Ok(code) => (code, format!("worker exited with code {code}")),
                    Err(_) => {
                        error!("Persistence worker thread panicked");
                        (PANIC_EXIT_CODE, "worker thread panicked".to_string())
                    }
                };
                let _ = event_tx.send(WorkerEvent::Exited {
                    code: Some(code),
                    reason,
                });
            })
            .map_err(|e| ChannelError::Transport(format!("Failed to spawn worker thread: {}", e)))?;

        *running = Some(RunningThread {
            requests: request_tx,
            handle,
        });
        Ok(event_rx)
    }

    async fn send(&self, message: String) -> Result<()> {
        let running = self.running.lock();
        let thread = running.as_ref().ok_or(ChannelError::NotStarted)?;
        thread
            .requests
            .send(message)
            .map_err(|_| ChannelError::Transport("worker thread is gone".into()))
    }

    async fn terminate(&self) -> Result<()> {
        let Some(RunningThread { requests, handle }) = self.running.lock().take() else {
            return Ok(());
        };

        // Closing the request queue ends the worker loop after the request in hand.
        drop(requests);
        let joined = tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|e| ChannelError::Transport(format!("Failed to join worker thread: {}", e)))?;
        if joined.is_err() {
            debug!("Persistence worker thread ended with a panic");
        }
        info!("Persistence worker thread stopped");
        Ok(())
    }
}
