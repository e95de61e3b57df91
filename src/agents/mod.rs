//! 领域 Agent：Recipe / Planning / Nutrition / Shopping
//!
//! 每个 Agent 持有自己的 ToolRegistry 与共享的 CompletionClient，本身无每请求可变状态；
//! 一轮内的所有信息都经 AgentContext 传入。AgentSet 把封闭的 AgentName 枚举映射到实现，
//! 启动时构造一次，运行期不再扩展。

pub mod nutrition;
pub mod planning;
pub mod recipe;
pub mod shopping;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::{parse_json_reply, AgentContext, AgentError, AgentName, AgentReply};
use crate::llm::{merge_usage, CompletionClient, TokenUsage};
use crate::repository::MealRepository;
use crate::tools::{ToolRegistry, ToolResult};

pub use nutrition::NutritionAgent;
pub use planning::PlanningAgent;
pub use recipe::{ImportedRecipe, RecipeAgent, TextOrList};
pub use shopping::ShoppingAgent;

/// 领域 Agent 接口
#[async_trait]
pub trait DomainAgent: Send + Sync {
    fn name(&self) -> AgentName;

    /// 处理用户文本（可能带实体尾注）
    async fn process(&self, message: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError>;

    /// 接手另一个 Agent 转交的本轮：payload 是上一个响应的 data
    async fn handoff(&self, from: AgentName, payload: &Value, ctx: &AgentContext) -> Result<AgentReply, AgentError>;
}

/// 构造 Agent 所需的共享依赖
#[derive(Clone)]
pub struct AgentDeps {
    pub client: Arc<CompletionClient>,
    pub repo: Arc<dyn MealRepository>,
    pub tool_timeout: Duration,
}

impl AgentDeps {
    pub fn new(client: Arc<CompletionClient>, repo: Arc<dyn MealRepository>) -> Self {
        Self {
            client,
            repo,
            tool_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub(crate) fn registry(&self) -> ToolRegistry {
        ToolRegistry::new().with_timeout(self.tool_timeout)
    }
}

/// Agent 公共部分：工具调用与补全（自动累计用量）
pub struct AgentBase {
    client: Arc<CompletionClient>,
    tools: ToolRegistry,
}

impl AgentBase {
    pub fn new(client: Arc<CompletionClient>, tools: ToolRegistry) -> Self {
        Self { client, tools }
    }

    pub fn client(&self) -> &CompletionClient {
        &self.client
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub async fn tool(&self, name: &str, params: Value, ctx: &AgentContext) -> ToolResult {
        self.tools.execute(name, params, ctx).await
    }

    /// 文本补全，用量并入 usage
    pub async fn ask(
        &self,
        system: &str,
        user: &str,
        ctx: &AgentContext,
        usage: &mut Option<TokenUsage>,
    ) -> Result<String, AgentError> {
        let completion = self.client.complete(system, user, ctx).await?;
        *usage = merge_usage(usage.take(), Some(&completion.usage));
        Ok(completion.content)
    }

    /// 要求 JSON 回复；解析失败返回 Ok(None)，由调用方走确定性降级
    pub async fn ask_json<T: DeserializeOwned>(
        &self,
        system: &str,
        user: &str,
        ctx: &AgentContext,
        usage: &mut Option<TokenUsage>,
    ) -> Result<Option<T>, AgentError> {
        let text = self.ask(system, user, ctx, usage).await?;
        let parsed = parse_json_reply(&text);
        if parsed.is_none() {
            tracing::debug!(reply_chars = text.chars().count(), "agent reply not parseable, using fallback");
        }
        Ok(parsed)
    }
}

/// 封闭枚举 → Agent 实现
pub struct AgentSet {
    recipe: Arc<dyn DomainAgent>,
    planning: Arc<dyn DomainAgent>,
    nutrition: Arc<dyn DomainAgent>,
    shopping: Arc<dyn DomainAgent>,
}

impl AgentSet {
    pub fn new(
        recipe: Arc<dyn DomainAgent>,
        planning: Arc<dyn DomainAgent>,
        nutrition: Arc<dyn DomainAgent>,
        shopping: Arc<dyn DomainAgent>,
    ) -> Self {
        Self {
            recipe,
            planning,
            nutrition,
            shopping,
        }
    }

    /// 用同一组依赖构造四个标准 Agent
    pub fn standard(deps: &AgentDeps, fetcher: Arc<dyn crate::tools::PageFetcher>, max_page_chars: usize) -> Self {
        Self::new(
            Arc::new(RecipeAgent::new(deps, fetcher, max_page_chars)),
            Arc::new(PlanningAgent::new(deps)),
            Arc::new(NutritionAgent::new(deps)),
            Arc::new(ShoppingAgent::new(deps)),
        )
    }

    pub fn get(&self, name: AgentName) -> &dyn DomainAgent {
        match name {
            AgentName::Recipe => self.recipe.as_ref(),
            AgentName::Planning => self.planning.as_ref(),
            AgentName::Nutrition => self.nutrition.as_ref(),
            AgentName::Shopping => self.shopping.as_ref(),
        }
    }
}

/// 小写文本是否包含任一关键词
pub(crate) fn mentions(lower: &str, words: &[&str]) -> bool {
    words.iter().any(|w| lower.contains(w))
}

/// handoff payload 中携带的原始请求
pub(crate) fn handoff_request(payload: &Value) -> Option<&str> {
    payload.get("request").and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}
