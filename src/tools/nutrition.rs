//! Nutrition Agent 的工具：单个菜谱营养、饮食档案

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{AgentContext, AgentError};
use crate::repository::MealRepository;
use crate::tools::{AgentTool, ParamType, ToolParameter, ToolSchema};

/// 取菜谱营养：菜谱自带则直接返回，否则按配料估算
pub struct RecipeNutritionTool {
    schema: ToolSchema,
    repo: Arc<dyn MealRepository>,
}

impl RecipeNutritionTool {
    pub fn new(repo: Arc<dyn MealRepository>) -> Self {
        Self {
            schema: ToolSchema::new("get_recipe_nutrition", "Per-serving nutrition of a saved recipe")
                .param(ToolParameter::required("recipe", ParamType::String, "Recipe id or name")),
            repo,
        }
    }
}

#[async_trait]
impl AgentTool for RecipeNutritionTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value, ctx: &AgentContext) -> Result<Value, AgentError> {
        let key = params["recipe"].as_str().unwrap_or_default();
        let recipe = self
            .repo
            .get_recipe(&ctx.user_id, key)
            .await?
            .ok_or_else(|| AgentError::ToolExecutionFailed(format!("Recipe '{key}' not found")))?;
        let (nutrition, estimated) = match recipe.nutrition {
            Some(n) => (n, false),
            None => (
                self.repo
                    .estimate_nutrition(&recipe.ingredients, recipe.servings.unwrap_or(1))
                    .await?,
                true,
            ),
        };
        Ok(json!({
            "recipe": { "id": recipe.id, "name": recipe.name, "ingredients": recipe.ingredients },
            "nutrition": nutrition,
            "estimated": estimated,
        }))
    }
}

/// 饮食档案：直接读取本轮共享记忆中的用户偏好
pub struct DietaryProfileTool {
    schema: ToolSchema,
}

impl Default for DietaryProfileTool {
    fn default() -> Self {
        Self::new()
    }
}

impl DietaryProfileTool {
    pub fn new() -> Self {
        Self {
            schema: ToolSchema::new(
                "get_dietary_profile",
                "The user's dietary restrictions, allergies and calorie target",
            ),
        }
    }
}

#[async_trait]
impl AgentTool for DietaryProfileTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, _params: Value, ctx: &AgentContext) -> Result<Value, AgentError> {
        serde_json::to_value(&ctx.memory.user_preferences).map_err(|e| AgentError::JsonParseError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryRepository, Nutrition, Recipe};

    #[tokio::test]
    async fn test_recipe_nutrition_prefers_stored_values() {
        let repo = Arc::new(InMemoryRepository::new());
        let stored = Nutrition {
            calories: 450.0,
            protein_g: 20.0,
            carbs_g: 50.0,
            fat_g: 15.0,
        };
        repo.add_recipe("u1", Recipe::new("r1", "Chili").with_nutrition(stored)).await;
        repo.add_recipe("u1", Recipe::new("r2", "Salad").with_ingredients(&["lettuce", "tomato"])).await;
        let tool = RecipeNutritionTool::new(repo);
        let ctx = AgentContext::new("u1");

        let chili = tool.execute(json!({"recipe": "chili"}), &ctx).await.unwrap();
        assert_eq!(chili["estimated"], json!(false));
        assert_eq!(chili["nutrition"]["calories"], json!(450.0));

        let salad = tool.execute(json!({"recipe": "r2"}), &ctx).await.unwrap();
        assert_eq!(salad["estimated"], json!(true));

        assert!(tool.execute(json!({"recipe": "pizza"}), &ctx).await.is_err());
    }
}
