use chat_tree::ConversationId;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{sort_recent_first, ConversationStore, StoredConversation};
use crate::error::StorageError;
use crate::protocol::ConversationSummary;

/// One JSON document per conversation
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn conversation_path(&self, id: &ConversationId) -> Result<PathBuf, StorageError> {
        let raw = id.as_str();
        let valid = !raw.is_empty()
            && !raw.starts_with('.')
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StorageError::InvalidParams(format!(
                "conversation id {raw:?} is not usable as a file name"
            )));
        }
        Ok(self.base_path.join(format!("{}.json", raw)))
    }
}

impl ConversationStore for FileStore {
    fn save(&mut self, record: StoredConversation) -> Result<(), StorageError> {
        let path = self.conversation_path(&record.conversation_id)?;
        let tmp_path = path.with_extension("json.tmp");

        let contents = serde_json::to_vec(&record)?;
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&contents)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn load(&mut self, id: &ConversationId) -> Result<Option<StoredConversation>, StorageError> {
        let path = self.conversation_path(id)?;
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&contents)?))
    }

    fn delete(&mut self, id: &ConversationId) -> Result<bool, StorageError> {
        let path = self.conversation_path(id)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }

    fn list(&mut self) -> Result<Vec<ConversationSummary>, StorageError> {
        let mut summaries = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record = fs::read(&path)
                .map_err(StorageError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<StoredConversation>(&bytes)?));
            match record {
                Ok(record) => summaries.push(record.summary()),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "FileStore: skipping unreadable conversation file")
                }
            }
        }
        sort_recent_first(&mut summaries);
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use tempfile::tempdir;

    fn record(id: &str) -> StoredConversation {
        StoredConversation {
            conversation_id: ConversationId::from(id),
            title: Some("Greeting".into()),
            updated_at: Utc::now(),
            tree: json!({ "branches": [], "rootBranchIds": [], "currentPath": [] }),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        store.save(record("c1")).unwrap();
        let loaded = store.load(&ConversationId::from("c1")).unwrap().unwrap();
        assert_eq!(loaded, record_with_time("c1", loaded.updated_at));
        assert!(!dir.path().join("c1.json.tmp").exists());
    }

    fn record_with_time(id: &str, at: chrono::DateTime<Utc>) -> StoredConversation {
        StoredConversation {
            updated_at: at,
            ..record(id)
        }
    }

    #[test]
    fn test_save_replaces_previous_version() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        store.save(record("c4")).unwrap();
        let mut renamed = record("c4");
        renamed.title = Some("Renamed".into());
        store.save(renamed).unwrap();

        let on_disk = fs::read(dir.path().join("c4.json")).unwrap();
        let parsed: StoredConversation = serde_json::from_slice(&on_disk).unwrap();
        assert_eq!(parsed.title.as_deref(), Some("Renamed"));
        assert!(!dir.path().join("c4.json.tmp").exists());
    }

    #[test]
    fn test_missing_and_delete() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        let id = ConversationId::from("c2");

        assert!(store.load(&id).unwrap().is_none());
        assert!(!store.delete(&id).unwrap());

        store.save(record("c2")).unwrap();
        assert!(store.delete(&id).unwrap());
        assert!(store.load(&id).unwrap().is_none());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();

        let result = store.load(&ConversationId::from("../escape"));
        assert!(matches!(result, Err(StorageError::InvalidParams(_))));
    }

    #[test]
    fn test_list_skips_garbage() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::open(dir.path()).unwrap();
        store.save(record("c3")).unwrap();
        fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].conversation_id, ConversationId::from("c3"));
    }
}
