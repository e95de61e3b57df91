//! 编排器：一轮对话的状态机
//!
//! 分类意图 → 按静态表路由到领域 Agent（去重、按序、可链式转交）→ 聚合 → 持久化 → 附加用量元数据。
//! 一轮内的全部调用顺序执行；每轮的累计状态（用量、响应列表）只存在于本次调用链。
//! 任何未处理的错误在最外层被捕获一次，转为通用的失败响应。

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::agents::AgentSet;
use crate::core::routing::{enrich_message, plan_agents};
use crate::core::{
    parse_json_reply, AgentContext, AgentError, AgentName, AgentReply, AgentResponse, Entity, IntentClassification,
};
use crate::llm::{CompletionClient, TokenUsage};
use crate::memory::{ConversationStore, MemoryLoader, NewMessage, Role};
use crate::tools::classification_schema_json;

const TURN_FAILED_MESSAGE: &str = "Sorry, something went wrong while handling your request. Please try again.";

const CLASSIFY_PROMPT: &str = r#"You classify messages sent to a meal-planning assistant.

Intents:
- parse_recipe: the user shares a recipe link, photo or text to import
- save_recipe: the user wants to keep a recipe
- plan_meals: plan meals for several days
- suggest_meal: pick what to eat next
- analyze_nutrition: calories, macros, dietary fit, intake summaries
- generate_shopping_list: build a grocery list
- check_leftovers: use up leftovers or review the pantry
- get_substitution: replace an ingredient
- general_question: cooking or food questions that need none of the above
- unknown: anything else

Entity types: url, recipe_name, ingredient, date, meal_type, cuisine, dietary.

Reply with JSON only, matching this schema:
"#;

const DIRECT_PROMPT: &str = "You are a friendly meal-planning assistant. Answer the user's question directly and concisely.";

const AGGREGATE_PROMPT: &str = r#"Several specialist assistants answered parts of the user's request. Combine their answers into one coherent reply without inventing new facts.
Reply with JSON only: {"message": string, "data": object}"#;

/// 编排参数
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// 加载进共享记忆的最近消息条数
    pub history_limit: usize,
    /// 单轮内链式转交的最大次数
    pub max_chain_depth: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            history_limit: 10,
            max_chain_depth: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
struct UnifiedReply {
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// 一轮内的累计状态
#[derive(Default)]
struct Turn {
    classification: Option<IntentClassification>,
    invoked: Vec<AgentName>,
    usage: Option<TokenUsage>,
}

pub struct Orchestrator {
    client: Arc<CompletionClient>,
    agents: AgentSet,
    store: Arc<dyn ConversationStore>,
    memory: Arc<dyn MemoryLoader>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        client: Arc<CompletionClient>,
        agents: AgentSet,
        store: Arc<dyn ConversationStore>,
        memory: Arc<dyn MemoryLoader>,
    ) -> Self {
        Self {
            client,
            agents,
            store,
            memory,
            settings: OrchestratorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 为一轮对话构建上下文：加载一次共享记忆，并附上该会话最近的消息
    pub async fn build_context(&self, user_id: &str, conversation_id: Option<&str>) -> Result<AgentContext, AgentError> {
        let mut memory = self.memory.load_shared_memory(user_id).await?;
        let mut ctx = AgentContext::new(user_id);
        if let Some(id) = conversation_id {
            match self.store.load_recent_messages(id, self.settings.history_limit).await {
                Ok(messages) => memory.conversation_history = messages.iter().map(|m| m.to_history()).collect(),
                Err(e) => tracing::warn!(conversation_id = %id, error = %e, "failed to load conversation history"),
            }
            ctx = ctx.with_conversation(id);
        }
        Ok(ctx.with_memory(memory))
    }

    /// 一轮对话的唯一入口；永不返回 Err
    ///
    /// 整轮用量取自本轮上下文的累计器：每次成功的补全都计入，即使发起它的 Agent 随后失败。
    pub async fn process(&self, message: &str, ctx: &AgentContext) -> AgentResponse {
        let start = Instant::now();
        let mut turn = Turn::default();
        let turn_ctx = ctx.clone().with_fresh_usage();
        let ctx = &turn_ctx;

        let outcome = self.run_turn(message, ctx, &mut turn).await;
        turn.usage = ctx.usage.total();
        let mut response = match outcome {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(user_id = %ctx.user_id, error = %e, "turn failed");
                AgentResponse::failure(TURN_FAILED_MESSAGE, e.public_message())
            }
        };

        let conversation_id = self.ensure_conversation(ctx).await;
        let intent = turn
            .classification
            .as_ref()
            .map(|c| c.primary_intent)
            .unwrap_or(crate::core::Intent::Unknown);
        let meta = json!({
            "executionTimeMs": start.elapsed().as_millis() as u64,
            "tokenUsage": turn.usage,
            "intent": intent,
            "conversationId": conversation_id,
            "agents": turn.invoked,
        });
        attach_meta(&mut response, meta);

        if let Some(id) = &conversation_id {
            self.persist_turn(id, message, &response, &turn).await;
        }
        tracing::info!(
            user_id = %ctx.user_id,
            intent = %intent,
            agents = ?turn.invoked,
            success = response.success,
            duration_ms = start.elapsed().as_millis() as u64,
            "turn complete"
        );
        response
    }

    async fn run_turn(&self, message: &str, ctx: &AgentContext, turn: &mut Turn) -> Result<AgentResponse, AgentError> {
        let (classification, _) = self.classify_intent(message, ctx).await?;
        turn.classification = Some(classification.clone());

        let responses = self.route(message, &classification, ctx, turn).await;
        let (response, _) = self
            .aggregate_responses(message, &classification.entities, responses, ctx)
            .await?;
        Ok(response)
    }

    /// 意图分类；模型输出无法解析时降级为 unknown，补全服务失败则返回 Err
    pub async fn classify_intent(
        &self,
        message: &str,
        ctx: &AgentContext,
    ) -> Result<(IntentClassification, TokenUsage), AgentError> {
        let system = format!("{CLASSIFY_PROMPT}{}", classification_schema_json());
        let completion = self.client.complete(&system, message, ctx).await?;
        let classification = match parse_json_reply::<IntentClassification>(&completion.content) {
            Some(c) => c.normalized(),
            None => {
                tracing::warn!("intent classification unparseable, treating as unknown");
                IntentClassification::unknown()
            }
        };
        tracing::info!(
            intent = %classification.primary_intent,
            secondary = ?classification.secondary_intents,
            confidence = classification.confidence,
            entities = classification.entities.len(),
            "intent classified"
        );
        Ok((classification, completion.usage))
    }

    /// 顺序调用 Agent：主意图的在前，去重；响应带 nextAgent 时立即转交
    async fn route(
        &self,
        message: &str,
        classification: &IntentClassification,
        ctx: &AgentContext,
        turn: &mut Turn,
    ) -> Vec<(AgentName, AgentResponse)> {
        let mut responses = Vec::new();
        for agent in plan_agents(classification) {
            if turn.invoked.contains(&agent) {
                continue;
            }
            let enriched = enrich_message(message, agent, &classification.entities);
            turn.invoked.push(agent);
            let reply = self.agents.get(agent).process(&enriched, ctx).await;
            let mut current = (agent, absorb(agent, reply));

            let mut depth = 0;
            while let Some(next) = current.1.next_agent {
                if depth >= self.settings.max_chain_depth {
                    tracing::warn!(from = %current.0, to = %next, "chain depth limit reached");
                    break;
                }
                if turn.invoked.contains(&next) {
                    tracing::debug!(from = %current.0, to = %next, "handoff target already ran this turn");
                    break;
                }
                let payload = current.1.data.clone().unwrap_or_else(|| json!({}));
                tracing::info!(from = %current.0, to = %next, "agent handoff");
                turn.invoked.push(next);
                let reply = self.agents.get(next).handoff(current.0, &payload, ctx).await;
                let handed = (next, absorb(next, reply));
                responses.push(std::mem::replace(&mut current, handed));
                depth += 1;
            }
            responses.push(current);
        }
        responses
    }

    /// 聚合：0 个响应直接回答；1 个原样返回；多个再做一次统一补全，解析失败则拼接
    pub async fn aggregate_responses(
        &self,
        message: &str,
        entities: &[Entity],
        mut responses: Vec<(AgentName, AgentResponse)>,
        ctx: &AgentContext,
    ) -> Result<(AgentResponse, Option<TokenUsage>), AgentError> {
        match responses.len() {
            0 => {
                let prompt = if entities.is_empty() {
                    message.to_string()
                } else {
                    let details: Vec<String> = entities
                        .iter()
                        .map(|e| format!("- {}: {}", e.entity_type.as_str(), e.value))
                        .collect();
                    format!("{message}\n\nDetails mentioned:\n{}", details.join("\n"))
                };
                let completion = self.client.complete(DIRECT_PROMPT, &prompt, ctx).await?;
                Ok((AgentResponse::ok(completion.content), Some(completion.usage)))
            }
            1 => Ok((responses.remove(0).1, None)),
            _ => Ok(self.unify(message, responses, ctx).await),
        }
    }

    async fn unify(
        &self,
        message: &str,
        responses: Vec<(AgentName, AgentResponse)>,
        ctx: &AgentContext,
    ) -> (AgentResponse, Option<TokenUsage>) {
        let success = responses.iter().all(|(_, r)| r.success);
        let error = responses.iter().find_map(|(_, r)| r.error.clone());
        let actions = responses.iter().flat_map(|(_, r)| r.actions.clone()).collect();

        let sections: Vec<String> = responses
            .iter()
            .map(|(agent, r)| {
                format!(
                    "## {agent} (success: {})\nMessage: {}\nData: {}",
                    r.success,
                    r.message,
                    r.data.as_ref().map(Value::to_string).unwrap_or_else(|| "null".to_string())
                )
            })
            .collect();
        let prompt = format!("User request: {message}\n\n{}", sections.join("\n\n"));

        let (unified, usage) = match self.client.complete(AGGREGATE_PROMPT, &prompt, ctx).await {
            Ok(c) => (parse_json_reply::<UnifiedReply>(&c.content), Some(c.usage)),
            Err(e) => {
                tracing::warn!(error = %e, "aggregation completion failed, concatenating responses");
                (None, None)
            }
        };
        let (message, data) = match unified.filter(|u| !u.message.trim().is_empty()) {
            Some(u) => {
                let data = match u.data {
                    Some(Value::Object(m)) if !m.is_empty() => Value::Object(m),
                    _ => merged_data(&responses),
                };
                (u.message, data)
            }
            None => {
                let joined: Vec<&str> = responses
                    .iter()
                    .map(|(_, r)| r.message.as_str())
                    .filter(|m| !m.trim().is_empty())
                    .collect();
                (joined.join("\n\n"), merged_data(&responses))
            }
        };

        let response = AgentResponse {
            success,
            message,
            data: Some(data),
            actions,
            next_agent: None,
            error: if success { None } else { error },
        };
        (response, usage)
    }

    async fn ensure_conversation(&self, ctx: &AgentContext) -> Option<String> {
        if let Some(id) = &ctx.conversation_id {
            return Some(id.clone());
        }
        let context = json!({ "metadata": ctx.metadata });
        match self.store.create_conversation(&ctx.user_id, &context).await {
            Ok(id) => {
                tracing::info!(user_id = %ctx.user_id, conversation_id = %id, "conversation created");
                Some(id)
            }
            Err(e) => {
                tracing::error!(user_id = %ctx.user_id, error = %e, "failed to create conversation");
                None
            }
        }
    }

    /// 追加 user 与 orchestrator 两条消息并更新会话活跃时间；失败只记日志
    async fn persist_turn(&self, conversation_id: &str, message: &str, response: &AgentResponse, turn: &Turn) {
        let reply = NewMessage::new(Role::Orchestrator, response.message.clone())
            .with_tool_results(json!({
                "agents": turn.invoked,
                "success": response.success,
                "data": response.data,
                "actions": response.actions,
            }))
            .with_token_usage(turn.usage.clone());

        let result = async {
            self.store.append_message(conversation_id, NewMessage::user(message)).await?;
            self.store.append_message(conversation_id, reply).await?;
            self.store.touch_conversation(conversation_id).await
        }
        .await;
        if let Err(e) = result {
            tracing::error!(conversation_id = %conversation_id, error = %e, "failed to persist turn");
        }
    }
}

/// Agent 错误转为该 Agent 的失败响应，不中断本轮
fn absorb(agent: AgentName, reply: Result<AgentReply, AgentError>) -> AgentResponse {
    match reply {
        Ok(reply) => {
            tracing::debug!(
                agent = %agent,
                tokens = reply.usage.as_ref().map_or(0, |u| u.total_tokens()),
                success = reply.response.success,
                "agent replied"
            );
            reply.response
        }
        Err(e) => {
            tracing::error!(agent = %agent, error = %e, "agent failed");
            AgentResponse::failure(
                format!("The {agent} assistant couldn't finish this part of your request."),
                e.public_message(),
            )
        }
    }
}

/// 以 Agent 名为键合并各响应的 data
fn merged_data(responses: &[(AgentName, AgentResponse)]) -> Value {
    let mut merged = Map::new();
    for (agent, r) in responses {
        if let Some(d) = &r.data {
            merged.insert(agent.as_str().to_string(), d.clone());
        }
    }
    Value::Object(merged)
}

fn attach_meta(response: &mut AgentResponse, meta: Value) {
    let data = match response.data.take() {
        Some(Value::Object(mut m)) => {
            m.insert("_meta".to_string(), meta);
            Value::Object(m)
        }
        Some(other) => json!({ "value": other, "_meta": meta }),
        None => json!({ "_meta": meta }),
    };
    response.data = Some(data);
}
