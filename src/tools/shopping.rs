//! Shopping Agent 的工具：汇总计划内菜谱的配料

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{AgentContext, AgentError};
use crate::repository::MealRepository;
use crate::tools::{AgentTool, ParamType, ToolParameter, ToolSchema};

pub struct PlanIngredientsTool {
    schema: ToolSchema,
    repo: Arc<dyn MealRepository>,
}

impl PlanIngredientsTool {
    pub fn new(repo: Arc<dyn MealRepository>) -> Self {
        Self {
            schema: ToolSchema::new("get_plan_ingredients", "All ingredient lines needed by a meal plan")
                .param(ToolParameter::required("plan_id", ParamType::String, "Meal plan id")),
            repo,
        }
    }
}

#[async_trait]
impl AgentTool for PlanIngredientsTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value, ctx: &AgentContext) -> Result<Value, AgentError> {
        let plan_id = params["plan_id"].as_str().unwrap_or_default();
        let items = self.repo.plan_items(&ctx.user_id, plan_id).await?;
        let mut ingredients: Vec<String> = Vec::new();
        let mut recipes: Vec<String> = Vec::new();
        for item in &items {
            if recipes.contains(&item.recipe_name) {
                continue;
            }
            recipes.push(item.recipe_name.clone());
            if let Some(recipe) = self.repo.get_recipe(&ctx.user_id, &item.recipe_id).await? {
                ingredients.extend(recipe.ingredients);
            }
        }
        Ok(json!({
            "planId": plan_id,
            "meals": items.len(),
            "recipes": recipes,
            "ingredients": ingredients,
        }))
    }
}
