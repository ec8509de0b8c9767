//! Set of conversations with unsaved changes
//!
//! Each mark records a generation number. A flush snapshots `(id, generation)`
//! pairs and clears an id only when its generation is unchanged after the save,
//! so a change made while the save was in flight keeps the id dirty.

use chat_tree::ConversationId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct DirtyState {
    marks: HashMap<ConversationId, u64>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct DirtySet {
    state: Arc<Mutex<DirtyState>>,
    changed: Arc<Notify>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` dirty and wake the autosave task. Returns the mark's generation.
    pub fn mark(&self, id: &ConversationId) -> u64 {
        let generation = {
            let mut state = self.state.lock();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.marks.insert(id.clone(), generation);
            generation
        };
        self.changed.notify_one();
        generation
    }

    /// Dirty ids with their current generations, ordered by id.
    pub fn snapshot(&self) -> Vec<(ConversationId, u64)> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state
            .marks
            .iter()
            .map(|(id, generation)| (id.clone(), *generation))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn generation(&self, id: &ConversationId) -> Option<u64> {
        self.state.lock().marks.get(id).copied()
    }

    /// Clear `id` if it was not re-marked since `generation` was observed.
    pub fn clear_if_unchanged(&self, id: &ConversationId, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.marks.get(id) == Some(&generation) {
            state.marks.remove(id);
            true
        } else {
            false
        }
    }

    /// Drop `id` regardless of generation (the conversation is gone).
    pub fn forget(&self, id: &ConversationId) -> bool {
        self.state.lock().marks.remove(id).is_some()
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.state.lock().marks.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ConversationId> {
        self.snapshot().into_iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next `mark`; a mark made with nobody waiting is
    /// remembered for the next caller.
    pub async fn changed(&self) {
        self.changed.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_only_unchanged_generation() {
        let dirty = DirtySet::new();
        let id = ConversationId::from("c1");

        let first = dirty.mark(&id);
        let second = dirty.mark(&id);
        assert!(second > first);
        assert_eq!(dirty.len(), 1);

        assert!(!dirty.clear_if_unchanged(&id, first));
        assert!(dirty.contains(&id));
        assert!(dirty.clear_if_unchanged(&id, second));
        assert!(dirty.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted_and_forget() {
        let dirty = DirtySet::new();
        dirty.mark(&"b".into());
        dirty.mark(&"a".into());

        assert_eq!(dirty.ids(), vec![ConversationId::from("a"), ConversationId::from("b")]);
        assert!(dirty.forget(&"a".into()));
        assert!(!dirty.forget(&"a".into()));
        assert_eq!(dirty.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_before_wait_is_not_lost() {
        let dirty = DirtySet::new();
        let clone = dirty.clone();
        clone.mark(&"c".into());

        tokio::time::timeout(std::time::Duration::from_millis(100), dirty.changed())
            .await
            .unwrap();
    }
}
