//! Index of message IDs the downstream archive already holds.

use crate::error::{StorageError, StorageResult};
use chatvault_types::{ConversationId, MessageId};
use duckdb::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// DuckDB table of archived `(conversation, message)` pairs.
#[derive(Clone)]
pub struct ArchiveIndex {
    conn: Arc<Mutex<Connection>>,
}

impl ArchiveIndex {
    /// Opens or creates an archive index at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = crate::open_duckdb_with_wal_recovery(path, "256MB", 1)?;
        initialize_archive_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory archive index (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_archive_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Marks a message as archived. Re-recording is a no-op.
    pub fn record(&self, conversation: ConversationId, message_id: MessageId) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO archived_messages (conversation_id, message_id) VALUES (?, ?)",
            params![conversation.as_i64(), message_id],
        )?;
        Ok(())
    }

    /// Marks several messages as archived in one transaction.
    pub fn record_many(
        &self,
        conversation: ConversationId,
        message_ids: &[MessageId],
    ) -> StorageResult<()> {
        let mut ids = message_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO archived_messages (conversation_id, message_id) VALUES (?, ?)",
            )?;
            for id in ids {
                stmt.execute(params![conversation.as_i64(), id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// All archived IDs for a conversation, ascending and distinct.
    pub fn list_archived_ids(&self, conversation: ConversationId) -> StorageResult<Vec<MessageId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT message_id FROM archived_messages \
             WHERE conversation_id = ? ORDER BY message_id",
        )?;
        let ids = stmt
            .query_map(params![conversation.as_i64()], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn count(&self, conversation: ConversationId) -> StorageResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM archived_messages WHERE conversation_id = ?",
            params![conversation.as_i64()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

fn initialize_archive_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS archived_messages (
            conversation_id BIGINT NOT NULL,
            message_id BIGINT NOT NULL,
            archived_at TIMESTAMP DEFAULT current_timestamp,
            PRIMARY KEY (conversation_id, message_id)
        );
        "#,
    )?;
    Ok(())
}
