//! 补全客户端（所有 Agent 共用）
//!
//! - 从 SharedMemory 生成简短上下文摘要并拼到 system prompt 前部，保证各 Agent 的调用基于同一组事实
//! - 每次请求施加硬超时（默认 30s），超时即通过 CancellationToken 取消在途请求
//! - 成功调用的用量同时记入 ctx.usage，供编排器汇总整轮用量
//! - 按单价表计算 cost
//! - 上游失败（超时 / 非成功状态 / 网络）只在服务端记录原文，向调用方统一抛出 AiUnavailable

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentContext, AgentError, SharedMemory};
use crate::llm::{
    CompletionBackend, CompletionRequest, ContentPart, ImageInput, TokenUsage, ToolInvocation,
};
use crate::tools::ToolSchema;

/// 默认请求超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// 超时取消后等待后端收尾的上限
const CANCEL_GRACE: Duration = Duration::from_millis(250);
/// 上下文摘要中最多列出的最近菜谱数
const MAX_SUMMARY_RECIPES: usize = 5;

/// 一次补全的结果：自由文本、结构化工具调用、用量
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: TokenUsage,
}

/// 补全客户端：持有后端、model、超时与 max_tokens；无每请求可变状态，可跨请求共享
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    model: String,
    timeout: Duration,
    max_tokens: u32,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_tokens: 2048,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 纯文本补全
    pub async fn complete(
        &self,
        system_prompt: &str,
        user_message: &str,
        ctx: &AgentContext,
    ) -> Result<Completion, AgentError> {
        let request = self.request(system_prompt, ctx, vec![ContentPart::Text(user_message.to_string())], Vec::new());
        self.execute(request, ctx).await
    }

    /// 带工具的补全：工具 schema 按后端格式翻译后随请求发送，模型请求的工具调用单独返回
    pub async fn complete_with_tools(
        &self,
        system_prompt: &str,
        user_message: &str,
        ctx: &AgentContext,
        tools: &[ToolSchema],
    ) -> Result<Completion, AgentError> {
        let format = self.backend.tool_format();
        let tools = tools.iter().map(|t| t.to_wire(format)).collect();
        let request = self.request(system_prompt, ctx, vec![ContentPart::Text(user_message.to_string())], tools);
        self.execute(request, ctx).await
    }

    /// 图片补全：instruction 与图片一同发送
    pub async fn complete_with_image(
        &self,
        system_prompt: &str,
        instruction: &str,
        image: &ImageInput,
        ctx: &AgentContext,
    ) -> Result<Completion, AgentError> {
        let parts = vec![
            ContentPart::Text(instruction.to_string()),
            ContentPart::Image(image.clone()),
        ];
        let request = self.request(system_prompt, ctx, parts, Vec::new());
        self.execute(request, ctx).await
    }

    fn request(
        &self,
        system_prompt: &str,
        ctx: &AgentContext,
        user: Vec<ContentPart>,
        tools: Vec<serde_json::Value>,
    ) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            system: system_with_context(system_prompt, &ctx.memory),
            user,
            tools,
            max_tokens: self.max_tokens,
        }
    }

    async fn execute(&self, request: CompletionRequest, ctx: &AgentContext) -> Result<Completion, AgentError> {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let send = self.backend.send(&request, cancel.clone());
        tokio::pin!(send);

        // 超时先发取消信号，让后端中止在途请求；宽限期内仍未返回则直接丢弃 future
        let result = tokio::select! {
            out = &mut send => Ok(out),
            _ = tokio::time::sleep(self.timeout) => {
                cancel.cancel();
                let _ = timeout(CANCEL_GRACE, &mut send).await;
                Err(())
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(out)) => {
                let usage = TokenUsage::priced(&self.model, out.input_tokens, out.output_tokens);
                ctx.usage.record(&usage);
                tracing::debug!(
                    backend = self.backend.name(),
                    model = %self.model,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    duration_ms,
                    "completion ok"
                );
                Ok(Completion {
                    content: out.content,
                    tool_calls: out.tool_calls,
                    usage,
                })
            }
            Ok(Err(e)) => {
                // 原文只进服务端日志
                tracing::error!(
                    backend = self.backend.name(),
                    model = %self.model,
                    duration_ms,
                    error = %e,
                    "completion request failed"
                );
                Err(AgentError::AiUnavailable)
            }
            Err(()) => {
                tracing::error!(
                    backend = self.backend.name(),
                    model = %self.model,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "completion request timed out"
                );
                Err(AgentError::AiUnavailable)
            }
        }
    }
}

/// 由共享记忆生成上下文摘要（偏好、最多 5 个最近菜谱、可用剩菜、当前计划）；记忆为空时返回空串
pub fn context_summary(memory: &SharedMemory) -> String {
    let mut lines = Vec::new();
    if !memory.user_preferences.is_empty() {
        lines.push(format!("User preferences: {}", memory.user_preferences.summary()));
    }
    if !memory.recent_recipes.is_empty() {
        let names: Vec<&str> = memory
            .recent_recipes
            .iter()
            .take(MAX_SUMMARY_RECIPES)
            .map(|r| r.name.as_str())
            .collect();
        lines.push(format!("Recent recipes: {}", names.join(", ")));
    }
    let leftovers = memory.active_leftovers();
    if !leftovers.is_empty() {
        let items: Vec<String> = leftovers
            .iter()
            .map(|l| match (&l.quantity, l.expires_on) {
                (Some(q), Some(d)) => format!("{} ({q}, expires {d})", l.name),
                (Some(q), None) => format!("{} ({q})", l.name),
                (None, Some(d)) => format!("{} (expires {d})", l.name),
                (None, None) => l.name.clone(),
            })
            .collect();
        lines.push(format!("Leftovers: {}", items.join(", ")));
    }
    if let Some(plan) = &memory.active_plan {
        lines.push(format!("Active meal plan: {}", plan.id));
    }
    lines.join("\n")
}

fn system_with_context(system_prompt: &str, memory: &SharedMemory) -> String {
    let summary = context_summary(memory);
    if summary.is_empty() {
        system_prompt.to_string()
    } else {
        format!("Context:\n{summary}\n\n{system_prompt}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ActivePlan, Leftover, RecipeSummary, UserPreferences};
    use crate::llm::ScriptedBackend;
    use crate::tools::{ParamType, ToolParameter};
    use serde_json::json;

    fn recipe(i: usize) -> RecipeSummary {
        RecipeSummary {
            id: format!("r{i}"),
            name: format!("Recipe {i}"),
            cuisine: None,
            tags: vec![],
            total_time_minutes: None,
        }
    }

    fn ctx_with_memory() -> AgentContext {
        let memory = SharedMemory {
            user_preferences: UserPreferences {
                dietary_restrictions: vec!["vegetarian".into()],
                ..Default::default()
            },
            recent_recipes: (1..=7).map(recipe).collect(),
            active_plan: Some(ActivePlan {
                id: "plan-42".into(),
                name: None,
                start_date: None,
                end_date: None,
            }),
            leftovers: vec![
                Leftover {
                    id: "l1".into(),
                    name: "rice".into(),
                    quantity: Some("2 cups".into()),
                    expires_on: None,
                    used: false,
                },
                Leftover {
                    id: "l2".into(),
                    name: "old soup".into(),
                    quantity: None,
                    expires_on: None,
                    used: true,
                },
            ],
            conversation_history: vec![],
        };
        AgentContext::new("u1").with_memory(memory)
    }

    #[test]
    fn test_context_summary() {
        let summary = context_summary(&ctx_with_memory().memory);
        assert!(summary.contains("diet: vegetarian"));
        assert!(summary.contains("Recipe 5"));
        assert!(!summary.contains("Recipe 6"));
        assert!(summary.contains("rice (2 cups)"));
        assert!(!summary.contains("old soup"));
        assert!(summary.contains("Active meal plan: plan-42"));
        assert!(context_summary(&SharedMemory::default()).is_empty());
    }

    #[tokio::test]
    async fn test_complete_prepends_context_and_prices_usage() {
        let backend = Arc::new(ScriptedBackend::new().reply_with_usage("hello", 1_000, 500));
        let client = CompletionClient::new(backend.clone(), "gpt-4o-mini");
        let out = client.complete("You are a chef.", "hi", &ctx_with_memory()).await.unwrap();
        assert_eq!(out.content, "hello");
        assert_eq!(out.usage.input_tokens, 1_000);
        assert_eq!(out.usage.model, "gpt-4o-mini");
        assert!(out.usage.cost > 0.0);

        let req = &backend.requests()[0];
        assert!(req.system.starts_with("Context:\n"));
        assert!(req.system.ends_with("You are a chef."));
        assert_eq!(req.user_text(), "hi");
    }

    #[tokio::test]
    async fn test_failure_is_sanitized() {
        let secret = "sk-live-9f8e7d6c5b4a";
        let backend = Arc::new(
            ScriptedBackend::new().fail_status(401, format!("{{\"error\":\"invalid api key {secret}\"}}")),
        );
        let client = CompletionClient::new(backend, "gpt-4o-mini");
        let err = client.complete("sys", "hi", &AgentContext::new("u1")).await.unwrap_err();
        assert!(matches!(err, AgentError::AiUnavailable));
        assert!(!err.to_string().contains(secret));
        assert!(!format!("{err:?}").contains(secret));
        assert!(!err.public_message().contains(secret));
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_sanitizes() {
        let backend = Arc::new(ScriptedBackend::new().hang());
        let client = CompletionClient::new(backend.clone(), "gpt-4o-mini").with_timeout(Duration::from_millis(30));
        let err = client.complete("sys", "hi", &AgentContext::new("u1")).await.unwrap_err();
        assert_eq!(err.to_string(), "AI service temporarily unavailable");
        // 后端观察到了取消信号，而不只是被丢弃
        assert_eq!(backend.cancelled_count(), 1);
    }

    #[tokio::test]
    async fn test_usage_recorded_even_when_later_call_fails() {
        let backend = Arc::new(ScriptedBackend::new().reply("first").fail_status(500, "boom"));
        let client = CompletionClient::new(backend, "gpt-4o-mini");
        let ctx = AgentContext::new("u1");
        client.complete("sys", "one", &ctx).await.unwrap();
        assert!(client.complete("sys", "two", &ctx).await.is_err());
        let total = ctx.usage.total().unwrap();
        assert_eq!(total.input_tokens, 10);
        assert_eq!(total.output_tokens, 5);
    }

    #[tokio::test]
    async fn test_tools_are_translated_and_calls_extracted() {
        let backend = Arc::new(ScriptedBackend::new().tool_call("search_recipes", json!({"query": "tacos"})));
        let client = CompletionClient::new(backend.clone(), "gpt-4o-mini");
        let schema = ToolSchema::new("search_recipes", "Search saved recipes").param(ToolParameter::required(
            "query",
            ParamType::String,
            "Search text",
        ));
        let out = client
            .complete_with_tools("sys", "find tacos", &AgentContext::new("u1"), &[schema])
            .await
            .unwrap();
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].arguments["query"], json!("tacos"));
        let req = &backend.requests()[0];
        assert_eq!(req.tools[0]["function"]["name"], json!("search_recipes"));
    }

    #[tokio::test]
    async fn test_image_request_carries_image() {
        let backend = Arc::new(ScriptedBackend::new().reply("{}"));
        let client = CompletionClient::new(backend.clone(), "gpt-4o-mini");
        let image = ImageInput::Url {
            url: "https://img.example.com/card.jpg".into(),
        };
        client
            .complete_with_image("sys", "extract", &image, &AgentContext::new("u1"))
            .await
            .unwrap();
        assert!(backend.requests()[0].has_image());
    }
}
