//! Isolated conversation persistence worker
//!
//! The worker owns a storage backend (memory, directory of JSON files or
//! SQLite) and answers newline-delimited JSON requests. [`WorkerChannel`]
//! is the caller side: correlation, timeouts, admission control and
//! crash recovery over a pluggable [`WorkerTransport`].

pub mod channel;
pub mod config;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod transports;
pub mod types;
pub mod worker;

pub use channel::WorkerChannel;
pub use config::*;
pub use error::{ChannelError, Result, StorageError};
pub use protocol::*;
pub use transports::*;
pub use types::*;
