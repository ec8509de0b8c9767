//! Facade error types

use chat_tree::{CodecError, ConversationId, TreeError};
use persistence_worker::ChannelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("A reply is already being generated for conversation {0}")]
    GenerationInProgress(ConversationId),

    #[error("Worker channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Unexpected worker response: {0}")]
    UnexpectedResponse(String),
}

impl PersistenceError {
    /// The worker could not be reached; the operation is worth retrying.
    pub fn is_availability(&self) -> bool {
        matches!(self, PersistenceError::Channel(e) if e.is_availability())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Codec(CodecError::Serialization(e))
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
