//! 对话日志的数据类型：会话、消息角色、待追加消息与已存消息
//!
//! 日志只追加：消息写入后从不修改或删除。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{AgentName, HistoryEntry};
use crate::llm::TokenUsage;

/// 消息作者：用户、编排器或某个领域 Agent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Role {
    User,
    Orchestrator,
    Agent(AgentName),
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Orchestrator => "orchestrator",
            Role::Agent(name) => name.as_str(),
        }
    }

    /// 未知字符串按编排器处理
    pub fn parse(s: &str) -> Role {
        match s {
            "user" => Role::User,
            "recipe" => Role::Agent(AgentName::Recipe),
            "planning" => Role::Agent(AgentName::Planning),
            "nutrition" => Role::Agent(AgentName::Nutrition),
            "shopping" => Role::Agent(AgentName::Shopping),
            _ => Role::Orchestrator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::parse(&s)
    }
}

/// 会话记录
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 待追加的消息
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub tool_calls: Option<Value>,
    pub tool_results: Option<Value>,
    pub token_usage: Option<TokenUsage>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_results: None,
            token_usage: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn with_tool_calls(mut self, calls: Value) -> Self {
        self.tool_calls = Some(calls);
        self
    }

    pub fn with_tool_results(mut self, results: Value) -> Self {
        self.tool_results = Some(results);
        self
    }

    pub fn with_token_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.token_usage = usage;
        self
    }
}

/// 已写入日志的消息
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_new(conversation_id: &str, message: NewMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content,
            tool_calls: message.tool_calls,
            tool_results: message.tool_results,
            token_usage: message.token_usage,
            created_at: Utc::now(),
        }
    }

    pub fn to_history(&self) -> HistoryEntry {
        HistoryEntry {
            role: self.role.to_string(),
            content: self.content.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_string_roundtrip() {
        for role in [Role::User, Role::Orchestrator, Role::Agent(AgentName::Shopping)] {
            assert_eq!(Role::parse(role.as_str()), role);
        }
        assert_eq!(serde_json::to_value(Role::Agent(AgentName::Recipe)).unwrap(), "recipe");
        assert_eq!(Role::parse("system"), Role::Orchestrator);
    }

    #[test]
    fn test_stored_message_from_new() {
        let stored = StoredMessage::from_new("c1", NewMessage::user("hi").with_tool_results(serde_json::json!({"a": 1})));
        assert_eq!(stored.conversation_id, "c1");
        assert_eq!(stored.role, Role::User);
        assert!(stored.tool_results.is_some());
        assert_eq!(stored.to_history().role, "user");
    }
}
