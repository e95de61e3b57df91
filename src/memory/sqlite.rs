//! SQLite 会话存储
//!
//! 会话与消息持久化到 SQLite，跨重启保留对话日志。

#![cfg(feature = "sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;

use crate::core::AgentError;
use crate::memory::{ConversationStore, NewMessage, Role, StoredMessage};

fn store_err(e: sqlx::Error) -> AgentError {
    AgentError::Store(e.to_string())
}

fn to_json_text<T: serde::Serialize>(value: &Option<T>) -> Option<String> {
    value.as_ref().and_then(|v| serde_json::to_string(v).ok())
}

fn from_json_text<T: serde::de::DeserializeOwned>(text: Option<String>) -> Option<T> {
    text.and_then(|t| serde_json::from_str(&t).ok())
}

pub struct SqliteConversationStore {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteConversationStore {
    /// 打开（不存在则创建）数据库并建表
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(store_err)?;
        let store = Self { pool };
        store.init_tables().await.map_err(store_err)?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                context TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_calls TEXT,
                tool_results TEXT,
                token_usage TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversation_messages_conversation ON conversation_messages(conversation_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn conversation_exists(&self, id: &str) -> Result<bool, AgentError> {
        let row = sqlx::query("SELECT 1 FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_conversation(&self, user_id: &str, context: &Value) -> Result<String, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO conversations (id, user_id, context, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(context.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(id)
    }

    async fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<StoredMessage, AgentError> {
        if !self.conversation_exists(conversation_id).await? {
            return Err(AgentError::Store(format!("conversation {conversation_id} not found")));
        }
        let stored = StoredMessage::from_new(conversation_id, message);
        sqlx::query(
            "INSERT INTO conversation_messages
                (id, conversation_id, role, content, tool_calls, tool_results, token_usage, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&stored.id)
        .bind(conversation_id)
        .bind(stored.role.as_str())
        .bind(&stored.content)
        .bind(to_json_text(&stored.tool_calls))
        .bind(to_json_text(&stored.tool_results))
        .bind(to_json_text(&stored.token_usage))
        .bind(stored.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(stored)
    }

    async fn touch_conversation(&self, conversation_id: &str) -> Result<(), AgentError> {
        let result = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(AgentError::Store(format!("conversation {conversation_id} not found")));
        }
        Ok(())
    }

    async fn load_recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>, AgentError> {
        let rows = sqlx::query(
            "SELECT id, role, content, tool_calls, tool_results, token_usage, created_at
             FROM conversation_messages WHERE conversation_id = ?
             ORDER BY seq DESC LIMIT ?",
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut messages: Vec<StoredMessage> = rows
            .into_iter()
            .map(|row| {
                let role: String = row.get("role");
                let created_at: String = row.get("created_at");
                StoredMessage {
                    id: row.get("id"),
                    conversation_id: conversation_id.to_string(),
                    role: Role::parse(&role),
                    content: row.get("content"),
                    tool_calls: from_json_text(row.get("tool_calls")),
                    tool_results: from_json_text(row.get("tool_results")),
                    token_usage: from_json_text(row.get("token_usage")),
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                }
            })
            .collect();
        messages.reverse();
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AgentName;
    use crate::llm::TokenUsage;
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mealmind.db");

        let id = {
            let store = SqliteConversationStore::open(&path).await.unwrap();
            let id = store.create_conversation("u1", &json!({"channel": "web"})).await.unwrap();
            store.append_message(&id, NewMessage::user("plan my week")).await.unwrap();
            store
                .append_message(
                    &id,
                    NewMessage::new(Role::Orchestrator, "Here's your plan")
                        .with_tool_results(json!({"agents": ["planning"]}))
                        .with_token_usage(Some(TokenUsage::priced("gpt-4o-mini", 100, 50))),
                )
                .await
                .unwrap();
            store.touch_conversation(&id).await.unwrap();
            id
        };

        let store = SqliteConversationStore::open(&path).await.unwrap();
        let messages = store.load_recent_messages(&id, 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].token_usage.as_ref().unwrap().input_tokens, 100);
        assert_eq!(messages[1].tool_results.as_ref().unwrap()["agents"], json!(["planning"]));

        let last = store.load_recent_messages(&id, 1).await.unwrap();
        assert_eq!(last[0].content, "Here's your plan");
        assert_eq!(Role::parse("planning"), Role::Agent(AgentName::Planning));
    }

    #[tokio::test]
    async fn test_sqlite_unknown_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteConversationStore::open(dir.path().join("m.db")).await.unwrap();
        assert!(store.append_message("missing", NewMessage::user("x")).await.is_err());
        assert!(store.touch_conversation("missing").await.is_err());
    }
}
