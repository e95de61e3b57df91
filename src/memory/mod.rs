//! 记忆层：对话日志（只追加）与每轮共享记忆快照
//!
//! 编排器只依赖这里的两个契约；实现有内存版、SQLite 版（feature = "sqlite"）与基于仓库的快照加载器。

pub mod conversation;
pub mod in_memory;
pub mod snapshot;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::{AgentError, SharedMemory};

pub use conversation::{Conversation, NewMessage, Role, StoredMessage};
pub use in_memory::InMemoryStore;
pub use snapshot::RepositoryMemoryLoader;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteConversationStore;

/// 对话日志存储
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 创建会话，返回新 id
    async fn create_conversation(&self, user_id: &str, context: &Value) -> Result<String, AgentError>;

    async fn append_message(&self, conversation_id: &str, message: NewMessage) -> Result<StoredMessage, AgentError>;

    /// 更新最后活跃时间
    async fn touch_conversation(&self, conversation_id: &str) -> Result<(), AgentError>;

    /// 最近 limit 条消息，按时间正序
    async fn load_recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>, AgentError>;
}

/// 每轮开始时加载一次共享记忆
#[async_trait]
pub trait MemoryLoader: Send + Sync {
    async fn load_shared_memory(&self, user_id: &str) -> Result<SharedMemory, AgentError>;
}
