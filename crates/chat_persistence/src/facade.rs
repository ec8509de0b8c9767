//! The single durability entry point for conversations
//!
//! Tree edits happen in memory; callers mark the conversation dirty and the
//! facade writes it through the worker channel on the next flush. Saves for
//! one conversation never overlap; saves for different conversations run
//! concurrently.

use chat_tree::{codec, ConversationId};
use dashmap::DashMap;
use futures::future::join_all;
use persistence_worker::storage::StoredConversation;
use persistence_worker::{
    methods, ChannelStats, ConversationParams, ConversationSummary, SaveParams, WorkerChannel,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::autosave::{self, AutosaveHandle};
use crate::config::{AutosaveConfig, PersistenceConfig};
use crate::conversation::{Conversation, ConversationRegistry, SharedConversation};
use crate::dirty::DirtySet;
use crate::error::{PersistenceError, Result};

/// Outcome of one flush
#[derive(Debug, Default)]
pub struct FlushReport {
    pub saved: Vec<ConversationId>,
    /// Still dirty; retried on the next flush
    pub failed: Vec<(ConversationId, PersistenceError)>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct FacadeInner {
    channel: WorkerChannel,
    registry: ConversationRegistry,
    dirty: DirtySet,
    save_locks: DashMap<ConversationId, Arc<Mutex<()>>>,
    autosave: parking_lot::Mutex<Option<AutosaveHandle>>,
}

#[derive(Clone)]
pub struct PersistenceFacade {
    inner: Arc<FacadeInner>,
}

impl PersistenceFacade {
    pub fn new(channel: WorkerChannel, dirty: DirtySet) -> Self {
        Self {
            inner: Arc::new(FacadeInner {
                channel,
                registry: ConversationRegistry::new(),
                dirty,
                save_locks: DashMap::new(),
                autosave: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Build the channel from `config`, start the worker and, when enabled,
    /// the autosave task.
    pub async fn launch(config: &PersistenceConfig) -> Result<Self> {
        let facade = Self::new(config.build_channel(), DirtySet::new());
        facade.start().await?;
        if config.autosave.enabled {
            facade.spawn_autosave(config.autosave.clone());
        }
        info!(storage = %config.storage, "Persistence facade ready");
        Ok(facade)
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.channel.start().await?;
        Ok(())
    }

    pub fn channel(&self) -> &WorkerChannel {
        &self.inner.channel
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.inner.channel.stats()
    }

    pub fn dirty(&self) -> &DirtySet {
        &self.inner.dirty
    }

    pub fn registry(&self) -> &ConversationRegistry {
        &self.inner.registry
    }

    /// New empty conversation, registered and marked dirty.
    pub fn create(&self, title: Option<String>) -> (ConversationId, SharedConversation) {
        let id = ConversationId::new();
        let mut conversation = Conversation::new(id.clone());
        conversation.title = title;
        let shared = self.inner.registry.insert(conversation);
        self.inner.dirty.mark(&id);
        debug!(conversation_id = %id, "Created conversation");
        (id, shared)
    }

    pub fn get(&self, id: &ConversationId) -> Option<SharedConversation> {
        self.inner.registry.get(id)
    }

    /// The registered conversation, loading it from storage on first use.
    pub async fn open(&self, id: &ConversationId) -> Result<SharedConversation> {
        if let Some(shared) = self.inner.registry.get(id) {
            return Ok(shared);
        }
        let conversation = self.load(id).await?;
        Ok(self.inner.registry.get_or_insert(conversation))
    }

    /// Read a conversation from storage without registering it.
    pub async fn load(&self, id: &ConversationId) -> Result<Conversation> {
        let params = serde_json::to_value(ConversationParams {
            conversation_id: id.clone(),
        })?;
        let value = self
            .inner
            .channel
            .call(methods::LOAD_RECORD, Some(params))
            .await?;
        if value.is_null() {
            return Err(PersistenceError::ConversationNotFound(id.clone()));
        }

        let record: StoredConversation = serde_json::from_value(value)
            .map_err(|e| PersistenceError::UnexpectedResponse(e.to_string()))?;
        let tree = codec::from_value(&record.tree)?;
        debug!(conversation_id = %id, branches = tree.len(), "Loaded conversation");
        Ok(Conversation::restored(
            id.clone(),
            tree,
            record.title,
            record.updated_at,
        ))
    }

    /// Apply `edit` to the conversation, bump its timestamp and mark it dirty.
    pub async fn modify<F, R>(&self, id: &ConversationId, edit: F) -> Result<R>
    where
        F: FnOnce(&mut Conversation) -> R,
    {
        let shared = self.open(id).await?;
        let result = {
            let mut conversation = shared.write().await;
            let result = edit(&mut conversation);
            conversation.touch();
            result
        };
        self.mark_dirty(id);
        Ok(result)
    }

    pub fn mark_dirty(&self, id: &ConversationId) {
        let generation = self.inner.dirty.mark(id);
        debug!(conversation_id = %id, generation, "Marked conversation dirty");
    }

    /// Claim the conversation for one streamed reply.
    pub async fn begin_generation(&self, id: &ConversationId) -> Result<()> {
        let shared = self.open(id).await?;
        let mut conversation = shared.write().await;
        conversation.begin_generation()
    }

    pub async fn finish_generation(&self, id: &ConversationId) {
        if let Some(shared) = self.inner.registry.get(id) {
            shared.write().await.finish_generation();
        }
    }

    /// Save every dirty conversation. Ids whose save fails stay dirty.
    pub async fn flush(&self) -> FlushReport {
        let snapshot = self.inner.dirty.snapshot();
        let mut report = FlushReport::default();
        if snapshot.is_empty() {
            return report;
        }

        let saves = snapshot.into_iter().map(|(id, generation)| async move {
            let outcome = self.save_one(&id).await;
            (id, generation, outcome)
        });

        for (id, generation, outcome) in join_all(saves).await {
            match outcome {
                Ok(()) => {
                    if !self.inner.dirty.clear_if_unchanged(&id, generation) {
                        debug!(conversation_id = %id, "Changed during save, still dirty");
                    }
                    report.saved.push(id);
                }
                Err(PersistenceError::ConversationNotFound(_)) => {
                    debug!(conversation_id = %id, "Dropping dirty mark for unregistered conversation");
                    self.inner.dirty.forget(&id);
                }
                Err(e) => {
                    warn!(conversation_id = %id, error = %e, "Failed to save conversation");
                    report.failed.push((id, e));
                }
            }
        }

        info!(
            saved = report.saved.len(),
            failed = report.failed.len(),
            still_dirty = self.inner.dirty.len(),
            "Flush finished"
        );
        report
    }

    /// Save one conversation now, whether or not it is dirty.
    pub async fn save(&self, id: &ConversationId) -> Result<()> {
        let generation = self.inner.dirty.generation(id);
        self.save_one(id).await?;
        if let Some(generation) = generation {
            self.inner.dirty.clear_if_unchanged(id, generation);
        }
        Ok(())
    }

    async fn save_one(&self, id: &ConversationId) -> Result<()> {
        let lock = self.save_lock(id);
        let _guard = lock.lock().await;

        let shared = self
            .inner
            .registry
            .get(id)
            .ok_or_else(|| PersistenceError::ConversationNotFound(id.clone()))?;
        let params = {
            let conversation = shared.read().await;
            SaveParams {
                conversation_id: id.clone(),
                tree: codec::to_value(&conversation.tree)?,
                title: conversation.display_title(),
                updated_at: Some(conversation.updated_at),
            }
        };

        self.inner
            .channel
            .call(methods::SAVE, Some(serde_json::to_value(params)?))
            .await?;
        debug!(conversation_id = %id, "Saved conversation");
        Ok(())
    }

    fn save_lock(&self, id: &ConversationId) -> Arc<Mutex<()>> {
        self.inner
            .save_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Delete from storage and memory. `true` if anything existed.
    pub async fn delete(&self, id: &ConversationId) -> Result<bool> {
        let lock = self.save_lock(id);
        let deleted = {
            let _guard = lock.lock().await;
            let params = serde_json::to_value(ConversationParams {
                conversation_id: id.clone(),
            })?;
            let stored = self
                .inner
                .channel
                .call(methods::DELETE, Some(params))
                .await?;
            let cached = self.inner.registry.remove(id).is_some();
            self.inner.dirty.forget(id);
            stored.as_bool().unwrap_or(false) || cached
        };
        self.inner.save_locks.remove(id);
        info!(conversation_id = %id, deleted, "Deleted conversation");
        Ok(deleted)
    }

    /// Stored conversations, most recently updated first.
    pub async fn list(&self) -> Result<Vec<ConversationSummary>> {
        let value = self.inner.channel.call(methods::LIST, None).await?;
        if value == Value::Null {
            return Ok(Vec::new());
        }
        serde_json::from_value(value).map_err(|e| PersistenceError::UnexpectedResponse(e.to_string()))
    }

    /// Start the background flusher, replacing any running one.
    pub fn spawn_autosave(&self, config: AutosaveConfig) {
        let handle = autosave::spawn(self.clone(), config);
        if let Some(previous) = self.inner.autosave.lock().replace(handle) {
            previous.cancel();
        }
    }

    pub fn autosave_running(&self) -> bool {
        self.inner
            .autosave
            .lock()
            .as_ref()
            .map(AutosaveHandle::is_running)
            .unwrap_or(false)
    }

    /// Stop autosave, flush one last time and stop the worker. Returns the
    /// ids that could not be saved.
    pub async fn shutdown(&self) -> Vec<ConversationId> {
        let autosave = self.inner.autosave.lock().take();
        if let Some(handle) = autosave {
            handle.stop().await;
        }

        let report = self.flush().await;
        if let Err(e) = self.inner.channel.stop().await {
            warn!(error = %e, "Worker did not stop cleanly");
        }

        let left = self.inner.dirty.ids();
        if left.is_empty() {
            info!(saved = report.saved.len(), "Persistence shut down cleanly");
        } else {
            warn!(unsaved = left.len(), "Persistence shut down with unsaved conversations");
        }
        left
    }
}
