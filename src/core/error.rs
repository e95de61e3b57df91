//! Agent 错误类型
//!
//! AgentError 是整个编排层的错误；上游 LLM 的原始错误只在 llm::client 内部记录，
//! 越过该边界时统一折叠为 AiUnavailable，不携带任何上游文本。

use thiserror::Error;

/// 编排过程中可能出现的错误（LLM 不可用、工具、解析、存储、配置）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 补全服务不可用（超时、非成功状态码、网络错误）；Display 固定为通用文案
    #[error("AI service temporarily unavailable")]
    AiUnavailable,

    #[error("Tool {0} not found")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

impl AgentError {
    /// 可以放进 AgentResponse.error 返回给调用方的文本；存储与配置错误不外露细节
    pub fn public_message(&self) -> String {
        match self {
            AgentError::Store(_) => "Conversation storage is unavailable".to_string(),
            AgentError::ConfigError(_) => "Service is misconfigured".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ai_unavailable_is_generic() {
        assert_eq!(
            AgentError::AiUnavailable.to_string(),
            "AI service temporarily unavailable"
        );
    }

    #[test]
    fn test_public_message_hides_store_detail() {
        let err = AgentError::Store("database is locked at /var/lib/app.db".to_string());
        assert!(!err.public_message().contains("/var/lib"));
        let err = AgentError::ToolNotFound("scrape".to_string());
        assert_eq!(err.public_message(), "Tool scrape not found");
    }
}
