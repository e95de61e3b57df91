//! OpenAI 兼容 API 后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；请求体按 Chat Completions 线上格式
//! 自行构造（byot），以便同时携带工具 schema 与图片内容。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::Client;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::llm::{BackendError, CompletionBackend, CompletionOutput, CompletionRequest, ContentPart, ToolInvocation};

/// OpenAI 兼容后端：持有 Client；model 由每次请求指定
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
}

impl OpenAiBackend {
    pub fn new(base_url: Option<&str>, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
        }
    }

    fn to_request_body(request: &CompletionRequest) -> Value {
        let user_content = if request.has_image() {
            let parts: Vec<Value> = request
                .user
                .iter()
                .map(|p| match p {
                    ContentPart::Text(text) => json!({"type": "text", "text": text}),
                    ContentPart::Image(image) => json!({
                        "type": "image_url",
                        "image_url": {"url": image.as_url()}
                    }),
                })
                .collect();
            json!(parts)
        } else {
            json!(request.user_text())
        };

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": user_content},
            ],
        });
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        body
    }
}

/// 从 Chat Completions 响应中取首条 content、tool_calls 与 usage
fn parse_response(response: &Value) -> Result<CompletionOutput, BackendError> {
    let message = response
        .pointer("/choices/0/message")
        .ok_or_else(|| BackendError::Decode("response has no choices".to_string()))?;

    let content = message["content"].as_str().unwrap_or_default().to_string();

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .filter_map(|tc| {
                    let name = tc.pointer("/function/name")?.as_str()?.to_string();
                    // arguments 是 JSON 字符串；解析失败时保留原文
                    let raw = tc.pointer("/function/arguments").and_then(Value::as_str).unwrap_or("{}");
                    let arguments = serde_json::from_str(raw).unwrap_or_else(|_| json!({"_raw": raw}));
                    Some(ToolInvocation {
                        id: tc["id"].as_str().unwrap_or_default().to_string(),
                        name,
                        arguments,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CompletionOutput {
        content,
        tool_calls,
        input_tokens: response.pointer("/usage/prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
        output_tokens: response
            .pointer("/usage/completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    })
}

fn map_openai_error(err: OpenAIError) -> BackendError {
    match err {
        OpenAIError::Reqwest(e) => BackendError::Network(e.to_string()),
        OpenAIError::ApiError(api) => BackendError::Upstream(api.to_string()),
        other => BackendError::Decode(other.to_string()),
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionOutput, BackendError> {
        let body = Self::to_request_body(request);
        let chat = self.client.chat();
        let call = chat.create_byot(body);

        let response: Value = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            r = call => r.map_err(map_openai_error)?,
        };

        parse_response(&response)
    }
}
