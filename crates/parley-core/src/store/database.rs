//! libSQL message store.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::Connection;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{validate, MessageStore, StoreError};
use crate::message::{Message, UserId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    sender_id TEXT NOT NULL,
    recipient_id TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient_id, created_at);
"#;

/// libSQL-backed message store, file-based or in-memory.
#[derive(Clone)]
pub struct LibSqlMessageStore {
    /// For in-memory databases this must stay the same connection.
    conn: Arc<Mutex<Connection>>,
    initialized: Arc<AtomicBool>,
}

impl LibSqlMessageStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Open a database file, or an in-memory database when `path` is `None`.
    pub async fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        let location = match path {
            Some(path) => path.to_string_lossy().into_owned(),
            None => ":memory:".to_string(),
        };
        let db = libsql::Builder::new_local(&location).build().await?;
        let conn = db.connect()?;
        debug!(location = %location, "Opened message database");
        Ok(Self::new(conn))
    }

    /// Create the schema if not already done.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), StoreError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        conn.execute_batch(SCHEMA).await?;
        self.initialized.store(true, Ordering::Release);
        debug!("Message store schema initialized");

        Ok(())
    }

    /// Fetch a stored message by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Message>, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        let mut rows = conn
            .query(
                "SELECT id, sender_id, recipient_id, content, created_at FROM messages WHERE id = ?1",
                [id.to_string()],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };

        let id: String = row.get(0)?;
        let sender: String = row.get(1)?;
        let recipient: String = row.get(2)?;
        let content: String = row.get(3)?;
        let created_at: String = row.get(4)?;

        Ok(Some(Message {
            id: parse_uuid(&id)?,
            sender_id: UserId::new(parse_uuid(&sender)?),
            recipient_id: UserId::new(parse_uuid(&recipient)?),
            content,
            created_at: Some(
                DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StoreError::Database(format!("Invalid timestamp: {e}")))?
                    .with_timezone(&Utc),
            ),
        }))
    }

    /// Number of stored messages.
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.initialize().await?;
        let conn = self.conn.lock().await;

        let mut rows = conn.query("SELECT COUNT(*) FROM messages", ()).await?;
        match rows.next().await? {
            Some(row) => {
                let count: i64 = row.get(0)?;
                Ok(count.max(0) as u64)
            }
            None => Ok(0),
        }
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Database(format!("Invalid uuid {raw}: {e}")))
}

#[async_trait]
impl MessageStore for LibSqlMessageStore {
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn store(&self, message: &Message) -> Result<(), StoreError> {
        validate(message)?;
        self.initialize().await?;

        let created_at = message
            .created_at
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
            .unwrap_or_default();

        let conn = self.conn.lock().await;
        let inserted = conn
            .execute(
                r#"
                INSERT INTO messages (id, sender_id, recipient_id, content, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(id) DO NOTHING
                "#,
                (
                    message.id.to_string(),
                    message.sender_id.to_string(),
                    message.recipient_id.to_string(),
                    message.content.as_str(),
                    created_at,
                ),
            )
            .await?;

        if inserted == 0 {
            return Err(StoreError::Duplicate(message.id));
        }

        debug!("Message stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn create_test_store() -> LibSqlMessageStore {
        let store = LibSqlMessageStore::open(None).await.unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn ready_message(content: &str) -> Message {
        Message::new(UserId::random(), UserId::random(), content).prepare_for_delivery(Utc::now())
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let store = create_test_store().await;
        let msg = ready_message("Hello, world!");

        store.store(&msg).await.unwrap();

        let loaded = store.get(msg.id).await.unwrap().unwrap();
        assert_eq!(loaded, msg);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_reported_and_not_overwritten() {
        let store = create_test_store().await;
        let msg = ready_message("first");
        store.store(&msg).await.unwrap();

        let mut again = msg.clone();
        again.content = "second".into();
        let err = store.store(&again).await.unwrap_err();

        assert!(matches!(err, StoreError::Duplicate(id) if id == msg.id));
        assert_eq!(store.get(msg.id).await.unwrap().unwrap().content, "first");
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rejects_message_without_id() {
        let store = create_test_store().await;
        let msg = Message::new(UserId::random(), UserId::random(), "no id");

        let err = store.store(&msg).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let store = create_test_store().await;
        assert!(store.get(Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.db");
        let msg = ready_message("persisted");

        {
            let store = LibSqlMessageStore::open(Some(&path)).await.unwrap();
            store.store(&msg).await.unwrap();
        }

        let reopened = LibSqlMessageStore::open(Some(&path)).await.unwrap();
        assert_eq!(reopened.get(msg.id).await.unwrap().unwrap().content, "persisted");
    }
}
