//! 补全后端抽象
//!
//! 所有后端（OpenAI 兼容 / Scripted Mock）实现 CompletionBackend：发送一次请求并返回文本、
//! 结构化工具调用与 token 数。BackendError 携带上游原始信息，只允许在 llm::client 内部记录。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::tools::ToolFormat;

/// 图片输入：URL 或 base64 数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageInput {
    Url { url: String },
    #[serde(rename_all = "camelCase")]
    Base64 { media_type: String, data: String },
}

impl ImageInput {
    /// data URL 或原始 URL，供 image_url 类型内容使用
    pub fn as_url(&self) -> String {
        match self {
            ImageInput::Url { url } => url.clone(),
            ImageInput::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        }
    }
}

/// 用户消息的内容片段
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image(ImageInput),
}

/// 一次补全请求（system 已包含上下文摘要；tools 已按后端格式翻译）
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub user: Vec<ContentPart>,
    pub tools: Vec<Value>,
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// 拼出全部文本内容（日志 / 测试断言用）
    pub fn user_text(&self) -> String {
        self.user
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                ContentPart::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_image(&self) -> bool {
        self.user.iter().any(|p| matches!(p, ContentPart::Image(_)))
    }
}

/// 模型请求的结构化工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// 后端原始输出
#[derive(Debug, Clone, Default)]
pub struct CompletionOutput {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// 后端错误（含上游原文，禁止越过 CompletionClient）
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("request cancelled")]
    Cancelled,
}

/// 补全后端 trait
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// 后端名称（日志用）
    fn name(&self) -> &str;

    /// 工具 schema 的线上格式
    fn tool_format(&self) -> ToolFormat {
        ToolFormat::OpenAi
    }

    /// 发送请求；cancel 触发时应尽快放弃并返回 Cancelled
    async fn send(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionOutput, BackendError>;
}
