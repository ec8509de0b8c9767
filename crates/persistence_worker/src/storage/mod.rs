//! Storage backends used inside the worker
//!
//! All backends are synchronous: the worker runs one request at a time, so a
//! backend never sees concurrent writes.

mod file;
mod memory;
mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chat_tree::ConversationId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{StorageTarget, WorkerInit};
use crate::error::StorageError;
use crate::protocol::ConversationSummary;

/// One persisted conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub tree: Value,
}

impl StoredConversation {
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            conversation_id: self.conversation_id.clone(),
            title: self.title.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Durable home for conversation trees
pub trait ConversationStore: Send {
    /// Insert or replace
    fn save(&mut self, record: StoredConversation) -> Result<(), StorageError>;

    fn load(&mut self, id: &ConversationId) -> Result<Option<StoredConversation>, StorageError>;

    /// `true` if something was deleted
    fn delete(&mut self, id: &ConversationId) -> Result<bool, StorageError>;

    /// Most recently updated first
    fn list(&mut self) -> Result<Vec<ConversationSummary>, StorageError>;
}

/// Open the backend named by the init parameters.
pub fn open_store(init: &WorkerInit) -> Result<Box<dyn ConversationStore>, StorageError> {
    let store: Box<dyn ConversationStore> = match &init.storage {
        StorageTarget::Memory => Box::new(MemoryStore::new()),
        StorageTarget::Directory { path } => Box::new(FileStore::open(path)?),
        StorageTarget::Sqlite { path } => Box::new(SqliteStore::open(
            path,
            init.setup_script.as_deref(),
            &init.tunables,
        )?),
    };
    Ok(store)
}

pub(crate) fn sort_recent_first(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });
}
