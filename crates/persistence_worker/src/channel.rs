//! Request/response channel to a persistence worker
//!
//! Every call gets a fresh correlation id and a pending entry; the entry is
//! resolved by the worker's matching response, by the call's timeout, or by
//! the worker going away. Lifecycle:
//!
//! `stopped -> starting -> online -> (stopping -> stopped) | (crashed -> restarting -> starting)`

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelConfig, WorkerInit};
use crate::error::{ChannelError, Result};
use crate::protocol::{RpcRequest, WorkerMessage, WorkerSignal};
use crate::transports::{StdioConfig, StdioTransport, ThreadTransport, TransportFactory, WorkerTransport};
use crate::types::{ChannelState, ChannelStats, WorkerEvent};

type StartFuture = Shared<BoxFuture<'static, Result<()>>>;

/// A call waiting for its response
struct PendingCall {
    method: String,
    sender: oneshot::Sender<Result<Value>>,
    enqueued_at: Instant,
}

struct ChannelShared {
    state: ChannelState,
    /// Bumped for every launch and every stop; events from an older worker
    /// generation are ignored.
    generation: u64,
    transport: Option<Arc<dyn WorkerTransport>>,
    starting: Option<StartFuture>,
    pending: HashMap<String, PendingCall>,
    restart_cancel: Option<CancellationToken>,
    restart_attempts: u32,
    worker_starts: u64,
    last_failure: Option<String>,
    /// Why calls fail while stopped, when it is not simply "never started"
    fault: Option<ChannelError>,
}

struct ChannelInner {
    config: ChannelConfig,
    init: WorkerInit,
    factory: Box<dyn TransportFactory>,
    next_id: AtomicU64,
    shared: Mutex<ChannelShared>,
}

/// Handle to a worker channel. Clones share the same worker.
#[derive(Clone)]
pub struct WorkerChannel {
    inner: Arc<ChannelInner>,
}

impl WorkerChannel {
    pub fn new<F>(config: ChannelConfig, init: WorkerInit, factory: F) -> Self
    where
        F: TransportFactory + 'static,
    {
        Self {
            inner: Arc::new(ChannelInner {
                config,
                init,
                factory: Box::new(factory),
                next_id: AtomicU64::new(1),
                shared: Mutex::new(ChannelShared {
                    state: ChannelState::Stopped,
                    generation: 0,
                    transport: None,
                    starting: None,
                    pending: HashMap::new(),
                    restart_cancel: None,
                    restart_attempts: 0,
                    worker_starts: 0,
                    last_failure: None,
                    fault: None,
                }),
            }),
        }
    }

    /// Worker on a dedicated thread of this process.
    pub fn thread(config: ChannelConfig, init: WorkerInit) -> Self {
        Self::new(config, init, || -> Arc<dyn WorkerTransport> {
            Arc::new(ThreadTransport::new())
        })
    }

    /// Worker as a child process.
    pub fn process(config: ChannelConfig, init: WorkerInit, process: StdioConfig) -> Self {
        Self::new(config, init, move || -> Arc<dyn WorkerTransport> {
            Arc::new(StdioTransport::new(process.clone()))
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ChannelState {
        self.inner.shared.lock().state
    }

    /// Start the worker and wait for its ready signal.
    ///
    /// Idempotent: concurrent callers share one in-flight start, and an
    /// online channel returns immediately. An explicit start also cancels a
    /// scheduled restart and resets the restart budget, as does a successful
    /// automatic restart.
    pub async fn start(&self) -> Result<()> {
        let start = {
            let mut s = self.inner.shared.lock();
            let state = s.state;
            match state {
                ChannelState::Online => return Ok(()),
                ChannelState::Stopping => return Err(ChannelError::Stopped),
                ChannelState::Starting => match s.starting.clone() {
                    Some(start) => start,
                    None => ChannelInner::begin_launch(&self.inner, &mut s, false),
                },
                ChannelState::Stopped | ChannelState::Crashed | ChannelState::Restarting => {
                    if let Some(cancel) = s.restart_cancel.take() {
                        cancel.cancel();
                    }
                    s.restart_attempts = 0;
                    s.fault = None;
                    ChannelInner::begin_launch(&self.inner, &mut s, false)
                }
            }
        };
        start.await
    }

    /// Call with the configured default timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let timeout = Duration::from_millis(self.inner.config.request_timeout_ms);
        self.call_with_timeout(method, params, timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let line = serde_json::to_string(&RpcRequest::new(id.clone(), method, params))?;

        let (rx, transport) = {
            let mut s = self.inner.shared.lock();
            let transport = match (s.state, &s.transport) {
                (ChannelState::Online, Some(transport)) => transport.clone(),
                (ChannelState::Stopped, _) => {
                    return Err(s.fault.clone().unwrap_or(ChannelError::NotStarted))
                }
                (ChannelState::Stopping, _) => return Err(ChannelError::Stopped),
                (ChannelState::Crashed | ChannelState::Restarting, _) => {
                    return Err(ChannelError::WorkerCrashed(
                        s.last_failure
                            .clone()
                            .unwrap_or_else(|| "worker is restarting".to_string()),
                    ))
                }
                _ => return Err(ChannelError::NotStarted),
            };

            let limit = self.inner.config.max_pending;
            if s.pending.len() >= limit {
                warn!(method, pending = s.pending.len(), "Rejecting worker call: too many pending");
                return Err(ChannelError::CapacityExceeded { limit });
            }

            let (tx, rx) = oneshot::channel();
            s.pending.insert(
                id.clone(),
                PendingCall {
                    method: method.to_string(),
                    sender: tx,
                    enqueued_at: Instant::now(),
                },
            );
            (rx, transport)
        };

        debug!(request_id = %id, method, "Sending worker call");
        if let Err(e) = transport.send(line).await {
            self.inner.shared.lock().pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::WorkerCrashed(
                "call dropped without a response".to_string(),
            )),
            Err(_) => {
                self.inner.shared.lock().pending.remove(&id);
                let timeout_ms = timeout.as_millis() as u64;
                warn!(request_id = %id, method, timeout_ms, "Worker call timed out");
                Err(ChannelError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
        }
    }

    /// Reject everything pending, terminate the worker and return to `stopped`.
    pub async fn stop(&self) -> Result<()> {
        let (transport, pending) = {
            let mut s = self.inner.shared.lock();
            if let Some(cancel) = s.restart_cancel.take() {
                cancel.cancel();
            }
            if s.state == ChannelState::Stopped && s.transport.is_none() {
                return Ok(());
            }
            s.state = ChannelState::Stopping;
            s.generation += 1;
            s.starting = None;
            let pending: Vec<PendingCall> = s.pending.drain().map(|(_, call)| call).collect();
            (s.transport.take(), pending)
        };

        info!(rejected = pending.len(), "Stopping persistence worker channel");
        for call in pending {
            let _ = call.sender.send(Err(ChannelError::Stopped));
        }

        let result = match transport {
            Some(transport) => transport.terminate().await,
            None => Ok(()),
        };
        if let Err(e) = &result {
            warn!(error = %e, "Worker did not terminate cleanly");
        }

        let mut s = self.inner.shared.lock();
        s.state = ChannelState::Stopped;
        s.fault = None;
        s.restart_attempts = 0;
        result
    }

    pub fn stats(&self) -> ChannelStats {
        let s = self.inner.shared.lock();
        let now = Instant::now();
        ChannelStats {
            state: s.state,
            pending_calls: s.pending.len(),
            oldest_pending_age_ms: s
                .pending
                .values()
                .map(|call| call.enqueued_at)
                .min()
                .map(|at| now.duration_since(at).as_millis() as u64),
            restart_attempts: s.restart_attempts,
            worker_starts: s.worker_starts,
            last_failure: s.last_failure.clone(),
        }
    }
}

impl ChannelInner {
    /// Register a new launch as the in-flight start. Caller holds the lock.
    fn begin_launch(inner: &Arc<Self>, s: &mut ChannelShared, restarting: bool) -> StartFuture {
        s.generation += 1;
        s.state = ChannelState::Starting;
        let start = inner
            .clone()
            .launch(s.generation, restarting)
            .boxed()
            .shared();
        s.starting = Some(start.clone());
        start
    }

    async fn launch(self: Arc<Self>, generation: u64, restarting: bool) -> Result<()> {
        let transport = self.factory.create();
        info!(generation, restarting, storage = %self.init.storage, "Launching persistence worker");

        let outcome = match transport.spawn(&self.init).await {
            Ok(mut events) => {
                let startup = Duration::from_millis(self.config.startup_timeout_ms);
                match tokio::time::timeout(startup, wait_ready(&mut events)).await {
                    Ok(Ok(())) => Ok(events),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(ChannelError::StartFailed(format!(
                        "no ready signal within {}ms",
                        self.config.startup_timeout_ms
                    ))),
                }
            }
            Err(e) => Err(ChannelError::StartFailed(e.to_string())),
        };

        let events = match outcome {
            Ok(events) => events,
            Err(e) => {
                let _ = transport.terminate().await;
                {
                    let mut s = self.shared.lock();
                    if s.generation == generation {
                        s.starting = None;
                        s.last_failure = Some(e.to_string());
                        s.state = if restarting {
                            ChannelState::Crashed
                        } else {
                            ChannelState::Stopped
                        };
                    }
                }
                warn!(generation, error = %e, "Persistence worker failed to start");
                return Err(e);
            }
        };

        {
            let mut s = self.shared.lock();
            if s.generation == generation {
                s.state = ChannelState::Online;
                s.transport = Some(transport.clone());
                s.starting = None;
                s.worker_starts += 1;
                s.fault = None;
                if restarting {
                    // A recovered worker earns a fresh budget for its next crash.
                    s.restart_attempts = 0;
                }
                info!(generation, starts = s.worker_starts, "Persistence worker online");
                tokio::spawn(self.clone().pump(events, generation));
                return Ok(());
            }
        }

        // A stop() landed while this launch was in flight.
        debug!(generation, "Discarding superseded worker launch");
        let _ = transport.terminate().await;
        Err(ChannelError::Stopped)
    }

    /// Route worker output to pending calls until the worker exits.
    async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<WorkerEvent>, generation: u64) {
        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Message(line) => self.on_message(&line, generation),
                WorkerEvent::Exited { code, reason } => {
                    self.on_exit(code, reason, generation);
                    return;
                }
            }
        }
        self.on_exit(None, "worker event stream closed".to_string(), generation);
    }

    fn on_message(&self, line: &str, generation: u64) {
        let message = match serde_json::from_str::<WorkerMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable worker output");
                return;
            }
        };

        match message {
            WorkerMessage::Response(response) => {
                let call = {
                    let mut s = self.shared.lock();
                    if s.generation != generation {
                        return;
                    }
                    s.pending.remove(&response.id)
                };
                match call {
                    Some(call) => {
                        debug!(
                            request_id = %response.id,
                            method = %call.method,
                            ok = response.ok,
                            elapsed_ms = call.enqueued_at.elapsed().as_millis() as u64,
                            "Worker call completed"
                        );
                        let _ = call.sender.send(response.into_result().map_err(ChannelError::from));
                    }
                    None => debug!(request_id = %response.id, "Discarding response with no pending call"),
                }
            }
            WorkerMessage::Signal(WorkerSignal::Fatal { message }) => {
                error!(reason = %message, "Persistence worker reported a fatal error")
            }
            WorkerMessage::Signal(WorkerSignal::Ready) => {}
        }
    }

    fn on_exit(self: &Arc<Self>, code: Option<i32>, reason: String, generation: u64) {
        let mut s = self.shared.lock();
        if s.generation != generation
            || matches!(s.state, ChannelState::Stopping | ChannelState::Stopped)
        {
            debug!(generation, ?code, "Ignoring exit of retired worker");
            return;
        }

        let failure = match code {
            Some(code) => format!("{} (exit code {})", reason, code),
            None => reason,
        };
        let pending: Vec<PendingCall> = s.pending.drain().map(|(_, call)| call).collect();
        error!(
            generation,
            ?code,
            rejected = pending.len(),
            "Persistence worker exited unexpectedly"
        );
        for call in pending {
            let _ = call
                .sender
                .send(Err(ChannelError::WorkerCrashed(failure.clone())));
        }

        s.transport = None;
        s.starting = None;
        s.last_failure = Some(failure.clone());

        if self.config.restart.enabled {
            s.state = ChannelState::Crashed;
            let cancel = CancellationToken::new();
            s.restart_cancel = Some(cancel.clone());
            tokio::spawn(self.clone().restart_loop(cancel));
        } else {
            s.state = ChannelState::Stopped;
            s.fault = Some(ChannelError::WorkerCrashed(failure));
        }
    }

    async fn restart_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let attempt = {
                let mut s = self.shared.lock();
                if cancel.is_cancelled() {
                    return;
                }
                s.restart_attempts += 1;
                let attempt = s.restart_attempts;
                if attempt > self.config.restart.max_attempts {
                    let last_failure = s.last_failure.clone().unwrap_or_default();
                    error!(
                        attempts = attempt - 1,
                        last_failure = %last_failure,
                        "Giving up on persistence worker restarts"
                    );
                    s.state = ChannelState::Stopped;
                    s.restart_cancel = None;
                    s.fault = Some(ChannelError::RestartExhausted {
                        attempts: attempt - 1,
                        last_failure,
                    });
                    return;
                }
                s.state = ChannelState::Restarting;
                attempt
            };

            let delay_ms = self.config.restart.backoff_ms(attempt);
            info!(attempt, delay_ms, "Scheduling persistence worker restart");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = cancel.cancelled() => return,
            }

            let start = {
                let mut s = self.shared.lock();
                if cancel.is_cancelled() || s.state != ChannelState::Restarting {
                    return;
                }
                Self::begin_launch(&self, &mut s, true)
            };
            match start.await {
                Ok(()) => {
                    info!(attempt, "Persistence worker restarted");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Persistence worker restart failed"),
            }
        }
    }
}

async fn wait_ready(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Message(line) => match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Signal(WorkerSignal::Ready)) => return Ok(()),
                Ok(WorkerMessage::Signal(WorkerSignal::Fatal { message })) => {
                    return Err(ChannelError::StartFailed(message))
                }
                Ok(WorkerMessage::Response(response)) => {
                    warn!(request_id = %response.id, "Worker answered before signalling ready")
                }
                Err(e) => warn!(error = %e, "Ignoring unreadable worker output during startup"),
            },
            WorkerEvent::Exited { code, reason } => {
                return Err(ChannelError::StartFailed(format!(
                    "{} before ready (exit code {:?})",
                    reason, code
                )))
            }
        }
    }
    Err(ChannelError::StartFailed(
        "worker closed its output before ready".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageTarget;
    use crate::protocol::methods;
    use serde_json::json;

    fn memory_channel() -> WorkerChannel {
        WorkerChannel::thread(ChannelConfig::default(), WorkerInit::new(StorageTarget::Memory))
    }

    #[tokio::test]
    async fn test_thread_worker_lifecycle() {
        let channel = memory_channel();
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert_eq!(
            channel.call(methods::PING, None).await,
            Err(ChannelError::NotStarted)
        );

        channel.start().await.unwrap();
        channel.start().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Online);
        assert_eq!(channel.stats().worker_starts, 1);

        let pong = channel.call(methods::PING, None).await.unwrap();
        assert_eq!(pong, json!("pong"));

        channel.stop().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert_eq!(
            channel.call(methods::PING, None).await,
            Err(ChannelError::NotStarted)
        );
    }

    #[tokio::test]
    async fn test_remote_errors_keep_their_code() {
        let channel = memory_channel();
        channel.start().await.unwrap();

        let err = channel.call("vacuum", None).await.unwrap_err();
        assert!(matches!(&err, ChannelError::Remote { code, .. } if code == "unknown_method"));
        assert!(!err.is_availability());

        channel.stop().await.unwrap();
    }
}
