use chat_tree::ConversationId;
use std::collections::HashMap;

use super::{sort_recent_first, ConversationStore, StoredConversation};
use crate::error::StorageError;
use crate::protocol::ConversationSummary;

/// Process-local store, lost when the worker exits
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<ConversationId, StoredConversation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryStore {
    fn save(&mut self, record: StoredConversation) -> Result<(), StorageError> {
        self.records.insert(record.conversation_id.clone(), record);
        Ok(())
    }

    fn load(&mut self, id: &ConversationId) -> Result<Option<StoredConversation>, StorageError> {
        Ok(self.records.get(id).cloned())
    }

    fn delete(&mut self, id: &ConversationId) -> Result<bool, StorageError> {
        Ok(self.records.remove(id).is_some())
    }

    fn list(&mut self) -> Result<Vec<ConversationSummary>, StorageError> {
        let mut summaries: Vec<_> = self.records.values().map(|r| r.summary()).collect();
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}
