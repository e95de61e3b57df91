//! Planning Agent 的工具：最近菜谱、用餐历史、剩菜
//!
//! MealHistoryTool / LeftoversTool 也被 Nutrition、Shopping 各自实例化注册（类型复用，实例不共享）。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::core::{AgentContext, AgentError};
use crate::repository::MealRepository;
use crate::tools::{AgentTool, ParamType, ToolParameter, ToolSchema};

pub struct RecentRecipesTool {
    schema: ToolSchema,
    repo: Arc<dyn MealRepository>,
}

impl RecentRecipesTool {
    pub fn new(repo: Arc<dyn MealRepository>) -> Self {
        Self {
            schema: ToolSchema::new("get_recent_recipes", "List the user's most recently saved recipes")
                .param(ToolParameter::optional("limit", ParamType::Integer, "Maximum results (default 20)")),
            repo,
        }
    }
}

#[async_trait]
impl AgentTool for RecentRecipesTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value, ctx: &AgentContext) -> Result<Value, AgentError> {
        let limit = params["limit"].as_u64().unwrap_or(20).clamp(1, 100) as usize;
        let recipes = self.repo.recent_recipes(&ctx.user_id, limit).await?;
        Ok(json!({ "recipes": recipes }))
    }
}

/// 最近 N 天用餐记录
pub struct MealHistoryTool {
    schema: ToolSchema,
    repo: Arc<dyn MealRepository>,
}

impl MealHistoryTool {
    pub fn new(repo: Arc<dyn MealRepository>) -> Self {
        Self {
            schema: ToolSchema::new("get_meal_history", "Meals the user logged in the last N days")
                .param(ToolParameter::optional("days", ParamType::Integer, "Look-back window (default 7)")),
            repo,
        }
    }
}

#[async_trait]
impl AgentTool for MealHistoryTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value, ctx: &AgentContext) -> Result<Value, AgentError> {
        let days = params["days"].as_u64().unwrap_or(7).clamp(1, 365) as u32;
        let meals = self.repo.meal_history(&ctx.user_id, days).await?;
        Ok(json!({ "days": days, "meals": meals }))
    }
}

/// 今天仍可用的剩菜（未用完且未过期）
pub struct LeftoversTool {
    schema: ToolSchema,
    repo: Arc<dyn MealRepository>,
}

impl LeftoversTool {
    pub fn new(repo: Arc<dyn MealRepository>) -> Self {
        Self {
            schema: ToolSchema::new("get_leftovers", "Leftovers that are unused and not yet expired"),
            repo,
        }
    }
}

#[async_trait]
impl AgentTool for LeftoversTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, _params: Value, ctx: &AgentContext) -> Result<Value, AgentError> {
        let today = Utc::now().date_naive();
        let leftovers: Vec<_> = self
            .repo
            .leftovers(&ctx.user_id)
            .await?
            .into_iter()
            .filter(|l| l.is_active_on(today))
            .collect();
        Ok(json!({ "leftovers": leftovers }))
    }
}
