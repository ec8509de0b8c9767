use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::WorkerInit;
use crate::error::Result;
use crate::types::WorkerEvent;

pub mod stdio;
pub mod thread;

pub use stdio::{StdioConfig, StdioTransport};
pub use thread::ThreadTransport;

/// Connection to one worker instance
///
/// A transport is used for a single worker lifetime; restarts go through a
/// fresh transport from the [`TransportFactory`].
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Launch the worker with its init parameters. Every line the worker
    /// writes, and finally its exit, arrives on the returned receiver.
    async fn spawn(&self, init: &WorkerInit) -> Result<mpsc::UnboundedReceiver<WorkerEvent>>;

    /// Deliver one request line.
    async fn send(&self, message: String) -> Result<()>;

    /// Stop the worker and wait for it to go away.
    async fn terminate(&self) -> Result<()>;
}

/// Builds a transport for every (re)start
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Arc<dyn WorkerTransport>;
}

impl<F> TransportFactory for F
where
    F: Fn() -> Arc<dyn WorkerTransport> + Send + Sync,
{
    fn create(&self) -> Arc<dyn WorkerTransport> {
        self()
    }
}
