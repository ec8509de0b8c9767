//! Worker side of the channel
//!
//! The worker reads one request per line, executes requests strictly in
//! arrival order and writes one response per request. Before the first
//! request it opens the configured store and announces `ready`, or reports
//! `fatal` and exits when the store cannot be opened.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Instant;

use crate::config::{WorkerInit, WorkerTunables};
use crate::error::StorageError;
use crate::protocol::{
    methods, ConversationParams, RpcError, RpcRequest, RpcResponse, SaveParams, WorkerMessage,
    WorkerSignal,
};
use crate::storage::{open_store, ConversationStore, StoredConversation};

/// Exit code after a clean end of input
pub const EXIT_OK: i32 = 0;
/// Exit code when the store could not be opened
pub const EXIT_FATAL: i32 = 1;

pub struct WorkerRuntime {
    store: Box<dyn ConversationStore>,
    tunables: WorkerTunables,
}

impl WorkerRuntime {
    pub fn open(init: &WorkerInit) -> Result<Self, StorageError> {
        Ok(Self::with_store(open_store(init)?, init.tunables.clone()))
    }

    pub fn with_store(store: Box<dyn ConversationStore>, tunables: WorkerTunables) -> Self {
        Self { store, tunables }
    }

    /// Execute one request.
    pub fn handle(&mut self, request: RpcRequest) -> RpcResponse {
        let started = Instant::now();
        let RpcRequest { id, method, params } = request;

        let outcome = self.dispatch(&method, params.unwrap_or(Value::Null));

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms >= self.tunables.slow_request_ms {
            tracing::warn!(request_id = %id, method = %method, elapsed_ms, "Worker: slow request");
        }

        match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(e) => {
                tracing::debug!(request_id = %id, method = %method, error = %e, "Worker: request failed");
                RpcResponse::failure(id, e.into())
            }
        }
    }

    /// Execute one raw line. Returns the serialized response, or `None` for
    /// blank lines and lines that carry no usable request id.
    pub fn handle_line(&mut self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let response = match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => self.handle(request),
            Err(e) => {
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string));
                match id {
                    Some(id) => RpcResponse::failure(
                        id,
                        RpcError::new("invalid_request", e.to_string()),
                    ),
                    None => {
                        tracing::warn!(error = %e, "Worker: dropping unreadable request");
                        return None;
                    }
                }
            }
        };
        encode_message(&WorkerMessage::Response(response))
    }

    fn dispatch(&mut self, method: &str, params: Value) -> Result<Value, StorageError> {
        match method {
            methods::PING => Ok(Value::String("pong".into())),
            methods::SAVE => {
                let params: SaveParams = parse_params(params)?;
                let size = serde_json::to_vec(&params.tree)?.len();
                if size > self.tunables.max_payload_bytes {
                    return Err(StorageError::InvalidParams(format!(
                        "tree is {size} bytes, limit is {}",
                        self.tunables.max_payload_bytes
                    )));
                }
                if !params.tree.is_object() {
                    return Err(StorageError::InvalidParams("tree must be an object".into()));
                }
                self.store.save(StoredConversation {
                    conversation_id: params.conversation_id,
                    title: params.title,
                    updated_at: params.updated_at.unwrap_or_else(Utc::now),
                    tree: params.tree,
                })?;
                Ok(Value::Bool(true))
            }
            methods::LOAD => {
                let params: ConversationParams = parse_params(params)?;
                Ok(self
                    .store
                    .load(&params.conversation_id)?
                    .map(|record| record.tree)
                    .unwrap_or(Value::Null))
            }
            methods::LOAD_RECORD => {
                let params: ConversationParams = parse_params(params)?;
                match self.store.load(&params.conversation_id)? {
                    Some(record) => Ok(serde_json::to_value(record)?),
                    None => Ok(Value::Null),
                }
            }
            methods::DELETE => {
                let params: ConversationParams = parse_params(params)?;
                Ok(Value::Bool(self.store.delete(&params.conversation_id)?))
            }
            methods::LIST => Ok(serde_json::to_value(self.store.list()?)?),
            other => Err(StorageError::UnknownMethod(other.to_string())),
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, StorageError> {
    serde_json::from_value(params).map_err(|e| StorageError::InvalidParams(e.to_string()))
}

fn encode_message(message: &WorkerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(line) => Some(line),
        Err(e) => {
            tracing::error!(error = %e, "Worker: failed to encode message");
            None
        }
    }
}

/// Run a worker to completion over a line source and a line sink.
///
/// Returns the process exit code: [`EXIT_OK`] when the input ends,
/// [`EXIT_FATAL`] when the store cannot be opened.
pub fn serve<I, W>(init: &WorkerInit, incoming: I, mut emit: W) -> i32
where
    I: IntoIterator<Item = String>,
    W: FnMut(String),
{
    let mut runtime = match WorkerRuntime::open(init) {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(storage = %init.storage, error = %e, "Worker: failed to open store");
            if let Some(line) = encode_message(&WorkerMessage::Signal(WorkerSignal::Fatal {
                message: e.to_string(),
            })) {
                emit(line);
            }
            return EXIT_FATAL;
        }
    };

    tracing::info!(storage = %init.storage, "Worker: ready");
    if let Some(line) = encode_message(&WorkerMessage::Signal(WorkerSignal::Ready)) {
        emit(line);
    }

    let mut handled = 0u64;
    for line in incoming {
        if let Some(response) = runtime.handle_line(&line) {
            emit(response);
        }
        handled += 1;
    }

    tracing::info!(handled, "Worker: input closed, exiting");
    EXIT_OK
}
