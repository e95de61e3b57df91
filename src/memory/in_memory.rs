//! 内存版会话存储（进程内，重启即丢失）

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::AgentError;
use crate::memory::{Conversation, ConversationStore, NewMessage, StoredMessage};

#[derive(Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<String, Conversation>>,
    messages: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn conversation(&self, id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(id).cloned()
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn message_count(&self, conversation_id: &str) -> usize {
        self.messages.read().await.get(conversation_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn create_conversation(&self, user_id: &str, context: &Value) -> Result<String, AgentError> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let conversation = Conversation {
            id: id.clone(),
            user_id: user_id.to_string(),
            context: context.clone(),
            created_at: now,
            updated_at: now,
        };
        self.conversations.write().await.insert(id.clone(), conversation);
        self.messages.write().await.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<StoredMessage, AgentError> {
        let mut messages = self.messages.write().await;
        let log = messages
            .get_mut(conversation_id)
            .ok_or_else(|| AgentError::Store(format!("conversation {conversation_id} not found")))?;
        let stored = StoredMessage::from_new(conversation_id, message);
        log.push(stored.clone());
        Ok(stored)
    }

    async fn touch_conversation(&self, conversation_id: &str) -> Result<(), AgentError> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| AgentError::Store(format!("conversation {conversation_id} not found")))?;
        conversation.updated_at = Utc::now();
        Ok(())
    }

    async fn load_recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>, AgentError> {
        let messages = self.messages.read().await;
        let Some(log) = messages.get(conversation_id) else {
            return Ok(Vec::new());
        };
        let skip = log.len().saturating_sub(limit);
        Ok(log[skip..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_load_recent() {
        let store = InMemoryStore::new();
        let id = store.create_conversation("u1", &json!({"source": "test"})).await.unwrap();
        for i in 0..5 {
            store.append_message(&id, NewMessage::user(format!("m{i}"))).await.unwrap();
        }
        let recent = store.load_recent_messages(&id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m3");
        assert_eq!(recent[1].content, "m4");
        assert_eq!(recent[1].role, Role::User);
        assert!(store.load_recent_messages("missing", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_store_error() {
        let store = InMemoryStore::new();
        let err = store.append_message("nope", NewMessage::user("x")).await.unwrap_err();
        assert!(matches!(err, AgentError::Store(_)));
        assert!(store.touch_conversation("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_touch_updates_timestamp() {
        let store = InMemoryStore::new();
        let id = store.create_conversation("u1", &Value::Null).await.unwrap();
        let before = store.conversation(&id).await.unwrap().updated_at;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.touch_conversation(&id).await.unwrap();
        assert!(store.conversation(&id).await.unwrap().updated_at > before);
    }
}
