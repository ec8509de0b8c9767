//! chat_persistence - durability for conversation trees
//!
//! [`PersistenceFacade`] is the only entry point the application uses:
//! conversations live in a [`ConversationRegistry`], edits mark them in a
//! [`DirtySet`], and flushes (manual, debounced or periodic) write them
//! through the persistence worker channel.

pub mod autosave;
pub mod config;
pub mod conversation;
pub mod dirty;
pub mod error;
pub mod facade;

pub use autosave::AutosaveHandle;
pub use config::{AutosaveConfig, PersistenceConfig, WorkerLaunch};
pub use conversation::{Conversation, ConversationRegistry, GenerationStatus, SharedConversation};
pub use dirty::DirtySet;
pub use error::{PersistenceError, Result};
pub use facade::{FlushReport, PersistenceFacade};
