use chat_tree::ConversationId;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension as _};
use std::path::Path;
use std::time::Duration;

use super::{ConversationStore, StoredConversation};
use crate::config::WorkerTunables;
use crate::error::StorageError;
use crate::protocol::ConversationSummary;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    title TEXT,
    updated_at TEXT NOT NULL,
    tree TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS conversations_updated_at ON conversations (updated_at);";

/// Single-file SQLite database, one row per conversation
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(
        path: &Path,
        setup_script: Option<&str>,
        tunables: &WorkerTunables,
    ) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(tunables.busy_timeout_ms))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        if let Some(script) = setup_script.filter(|s| !s.trim().is_empty()) {
            conn.execute_batch(script)?;
        }

        tracing::info!(path = %path.display(), "SqliteStore: opened");
        Ok(Self { conn })
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidParams(format!("bad stored timestamp {raw:?}: {e}")))
}

impl ConversationStore for SqliteStore {
    fn save(&mut self, record: StoredConversation) -> Result<(), StorageError> {
        let tree = serde_json::to_string(&record.tree)?;
        self.conn.execute(
            "INSERT INTO conversations (id, title, updated_at, tree)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                updated_at = excluded.updated_at,
                tree = excluded.tree",
            params![
                record.conversation_id.as_str(),
                record.title,
                record.updated_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                tree
            ],
        )?;
        Ok(())
    }

    fn load(&mut self, id: &ConversationId) -> Result<Option<StoredConversation>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT title, updated_at, tree FROM conversations WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((title, updated_at, tree)) = row else {
            return Ok(None);
        };
        Ok(Some(StoredConversation {
            conversation_id: id.clone(),
            title,
            updated_at: parse_time(&updated_at)?,
            tree: serde_json::from_str(&tree)?,
        }))
    }

    fn delete(&mut self, id: &ConversationId) -> Result<bool, StorageError> {
        let removed = self
            .conn
            .execute("DELETE FROM conversations WHERE id = ?1", params![id.as_str()])?;
        Ok(removed > 0)
    }

    fn list(&mut self) -> Result<Vec<ConversationSummary>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title, updated_at FROM conversations ORDER BY updated_at DESC, id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, title, updated_at) = row?;
            summaries.push(ConversationSummary {
                conversation_id: ConversationId::from(id),
                title,
                updated_at: parse_time(&updated_at)?,
            });
        }
        Ok(summaries)
    }
}
