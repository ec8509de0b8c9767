//! Background flusher
//!
//! Flushes once changes have been quiet for `debounce_ms` (never waiting longer
//! than `interval_ms` after the first change), and on a periodic tick so
//! conversations left dirty by a failed flush are retried.

use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AutosaveConfig;
use crate::facade::PersistenceFacade;

pub struct AutosaveHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl AutosaveHandle {
    /// Signal the task to stop without waiting. A flush in progress completes.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the task, including a flush in progress.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

pub(crate) fn spawn(facade: PersistenceFacade, config: AutosaveConfig) -> AutosaveHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run(facade, config, cancel.clone()));
    AutosaveHandle { cancel, task }
}

async fn run(facade: PersistenceFacade, config: AutosaveConfig, cancel: CancellationToken) {
    let debounce = Duration::from_millis(config.debounce_ms);
    let max_wait = Duration::from_millis(config.interval_ms.max(1));
    let mut ticker = tokio::time::interval(max_wait);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    info!(
        debounce_ms = config.debounce_ms,
        interval_ms = config.interval_ms,
        "Autosave started"
    );
    let dirty = facade.dirty().clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = dirty.changed() => {
                let first_change = Instant::now();
                let mut deadline = first_change + debounce;
                loop {
                    let limit = (first_change + max_wait).min(deadline);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Autosave stopped");
                            return;
                        }
                        _ = sleep_until(limit) => break,
                        _ = dirty.changed() => deadline = Instant::now() + debounce,
                    }
                }
                debug!("Autosave flushing after changes settled");
                facade.flush().await;
            }
            _ = ticker.tick() => {
                if !dirty.is_empty() {
                    debug!(pending = dirty.len(), "Autosave periodic flush");
                    facade.flush().await;
                }
            }
        }
    }
    info!("Autosave stopped");
}
