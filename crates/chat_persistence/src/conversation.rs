//! In-memory conversations and the registry that holds them

use chat_tree::{parts_text, ConversationId, ConversationTree, Role};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{PersistenceError, Result};

const PREVIEW_CHARS: usize = 48;

/// Whether a reply is currently streaming into the conversation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    #[default]
    Idle,
    Generating,
}

/// A conversation tree plus the bookkeeping around it
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: Option<String>,
    pub tree: ConversationTree,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    generation_status: GenerationStatus,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: None,
            tree: ConversationTree::new(),
            created_at: now,
            updated_at: now,
            generation_status: GenerationStatus::Idle,
        }
    }

    /// Rebuild from storage. `created_at` comes from the oldest root turn when
    /// the tree has one.
    pub fn restored(
        id: ConversationId,
        tree: ConversationTree,
        title: Option<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let created_at = tree
            .root_branch_ids()
            .iter()
            .filter_map(|root| tree.branch(root))
            .filter_map(|branch| branch.versions().first())
            .map(|version| version.timestamp())
            .min()
            .unwrap_or(updated_at);
        Self {
            id,
            title,
            tree,
            created_at,
            updated_at,
            generation_status: GenerationStatus::Idle,
        }
    }

    pub fn generation_status(&self) -> GenerationStatus {
        self.generation_status
    }

    /// Claim the conversation for one reply. A second concurrent send is refused.
    pub fn begin_generation(&mut self) -> Result<()> {
        if self.generation_status == GenerationStatus::Generating {
            return Err(PersistenceError::GenerationInProgress(self.id.clone()));
        }
        self.generation_status = GenerationStatus::Generating;
        Ok(())
    }

    pub fn finish_generation(&mut self) {
        self.generation_status = GenerationStatus::Idle;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Explicit title, or the start of the first user message on the path.
    pub fn display_title(&self) -> Option<String> {
        if let Some(title) = &self.title {
            return Some(title.clone());
        }
        let first = self
            .tree
            .path_messages()
            .find(|message| message.role == Role::User)?;
        let text = parts_text(first.parts);
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
        if text.chars().count() > PREVIEW_CHARS {
            preview.push_str("...");
        }
        Some(preview)
    }
}

pub type SharedConversation = Arc<RwLock<Conversation>>;

/// Conversations currently held in memory, keyed by id
#[derive(Clone, Default)]
pub struct ConversationRegistry {
    entries: Arc<DashMap<ConversationId, SharedConversation>>,
}

impl ConversationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `conversation`, replacing any entry with the same id.
    pub fn insert(&self, conversation: Conversation) -> SharedConversation {
        let id = conversation.id.clone();
        let shared = Arc::new(RwLock::new(conversation));
        self.entries.insert(id, shared.clone());
        shared
    }

    /// Insert unless an entry already exists; returns whichever is registered.
    pub fn get_or_insert(&self, conversation: Conversation) -> SharedConversation {
        self.entries
            .entry(conversation.id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(conversation)))
            .clone()
    }

    pub fn get(&self, id: &ConversationId) -> Option<SharedConversation> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &ConversationId) -> Option<SharedConversation> {
        self.entries.remove(id).map(|(_, conversation)| conversation)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ConversationId> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
