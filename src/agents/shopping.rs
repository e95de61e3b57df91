//! Shopping Agent：由当前餐单生成购物清单，扣除已有剩菜，按货架分类

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::{handoff_request, mentions, AgentBase, AgentDeps, DomainAgent};
use crate::core::routing::split_enriched;
use crate::core::{ActionKind, AgentAction, AgentContext, AgentError, AgentName, AgentReply, AgentResponse, Leftover};
use crate::tools::{LeftoversTool, PlanIngredientsTool};

const CATEGORIZE_PROMPT: &str = r#"Group these shopping list items by grocery store section. Keep every item exactly as written and do not add items.
Reply with JSON only: {"categories": [{"name": string, "items": [string]}]}"#;

const SECTIONS: &[(&str, &[&str])] = &[
    (
        "Produce",
        &[
            "onion", "garlic", "tomato", "lettuce", "pepper", "carrot", "potato", "lemon", "lime", "apple", "banana",
            "cilantro", "spinach", "avocado", "ginger", "scallion", "herb",
        ],
    ),
    ("Meat & Seafood", &["chicken", "beef", "pork", "turkey", "bacon", "fish", "salmon", "shrimp", "sausage"]),
    ("Dairy & Eggs", &["milk", "cheese", "butter", "yogurt", "cream", "egg"]),
    ("Bakery", &["bread", "tortilla", "bun", "bagel", "pita"]),
    (
        "Pantry",
        &["flour", "sugar", "rice", "pasta", "noodle", "oil", "salt", "bean", "sauce", "spice", "vinegar", "stock", "broth", "can "],
    ),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShoppingCategory {
    pub name: String,
    pub items: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CategorizeReply {
    #[serde(default)]
    categories: Vec<ShoppingCategory>,
}

/// 去重（不区分大小写）并剔除已有剩菜覆盖的条目；返回 (待买, 被剩菜覆盖)
pub fn consolidate(ingredients: &[String], leftovers: &[Leftover]) -> (Vec<String>, Vec<String>) {
    let mut items: Vec<String> = Vec::new();
    let mut covered: Vec<String> = Vec::new();
    for line in ingredients {
        let line = line.trim();
        if line.is_empty() || items.iter().chain(&covered).any(|i| i.eq_ignore_ascii_case(line)) {
            continue;
        }
        let lower = line.to_lowercase();
        if leftovers.iter().any(|l| lower.contains(&l.name.to_lowercase())) {
            covered.push(line.to_string());
        } else {
            items.push(line.to_string());
        }
    }
    (items, covered)
}

/// 确定性分类：按关键词归入货架，未命中的进 Other
pub fn categorize(items: &[String]) -> Vec<ShoppingCategory> {
    let mut categories: Vec<ShoppingCategory> = Vec::new();
    for item in items {
        let lower = item.to_lowercase();
        let section = SECTIONS
            .iter()
            .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
            .map(|(name, _)| *name)
            .unwrap_or("Other");
        match categories.iter_mut().find(|c| c.name == section) {
            Some(c) => c.items.push(item.clone()),
            None => categories.push(ShoppingCategory {
                name: section.to_string(),
                items: vec![item.clone()],
            }),
        }
    }
    categories
}

/// 模型分类结果必须恰好覆盖全部条目
fn covers_exactly(categories: &[ShoppingCategory], items: &[String]) -> bool {
    let mut listed: Vec<&str> = categories.iter().flat_map(|c| c.items.iter().map(String::as_str)).collect();
    let mut expected: Vec<&str> = items.iter().map(String::as_str).collect();
    listed.sort_unstable();
    expected.sort_unstable();
    listed == expected
}

pub struct ShoppingAgent {
    base: AgentBase,
}

impl ShoppingAgent {
    pub fn new(deps: &AgentDeps) -> Self {
        let mut tools = deps.registry();
        tools.register(PlanIngredientsTool::new(deps.repo.clone()));
        tools.register(LeftoversTool::new(deps.repo.clone()));
        Self {
            base: AgentBase::new(deps.client.clone(), tools),
        }
    }

    async fn leftovers(&self, ctx: &AgentContext) -> Vec<Leftover> {
        self.base
            .tool("get_leftovers", Value::Null, ctx)
            .await
            .into_data()
            .and_then(|d| serde_json::from_value(d["leftovers"].clone()).ok())
            .unwrap_or_default()
    }

    async fn generate(&self, request: &str, plan_id: Option<String>, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let Some(plan_id) = plan_id.or_else(|| ctx.memory.active_plan.as_ref().map(|p| p.id.clone())) else {
            return Ok(AgentResponse::redirect(
                "You don't have an active meal plan yet, so let's make one first.",
                AgentName::Planning,
            )
            .with_data(json!({ "reason": "no_active_plan", "request": request }))
            .into());
        };

        let plan = self.base.tool("get_plan_ingredients", json!({ "plan_id": plan_id }), ctx).await;
        let Some(plan) = plan.into_data() else {
            return Ok(AgentResponse::failure(
                "I couldn't load your meal plan. Please try again.",
                "Meal plan unavailable",
            )
            .into());
        };
        let ingredients: Vec<String> = serde_json::from_value(plan["ingredients"].clone()).unwrap_or_default();
        if ingredients.is_empty() {
            return Ok(AgentResponse::failure(
                "Your meal plan doesn't have any recipes with ingredients yet.",
                "Meal plan has no ingredients",
            )
            .with_data(json!({ "planId": plan_id }))
            .into());
        }

        let leftovers = self.leftovers(ctx).await;
        let (items, covered) = consolidate(&ingredients, &leftovers);

        let mut usage = None;
        let categories = if items.is_empty() {
            Vec::new()
        } else {
            let prompt = format!("Items:\n{}", items.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n"));
            match self
                .base
                .ask_json::<CategorizeReply>(CATEGORIZE_PROMPT, &prompt, ctx, &mut usage)
                .await?
            {
                Some(r) if covers_exactly(&r.categories, &items) => r.categories,
                _ => categorize(&items),
            }
        };

        let mut message = format!(
            "Here's your shopping list: {} items for {} meals.",
            items.len(),
            plan["meals"].as_u64().unwrap_or(0)
        );
        if !covered.is_empty() {
            message.push_str(&format!(" Skipped {} you already have as leftovers.", covered.len()));
        }
        let list = json!({
            "planId": plan_id,
            "recipes": plan["recipes"],
            "categories": categories,
        });
        let response = AgentResponse::ok(message)
            .with_data(json!({
                "planId": plan_id,
                "itemCount": items.len(),
                "categories": categories,
                "coveredByLeftovers": covered,
            }))
            .with_action(AgentAction::new(ActionKind::SaveShoppingList, json!({ "list": list })));
        Ok(AgentReply::new(response, usage))
    }

    async fn pantry(&self, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let leftovers = self.leftovers(ctx).await;
        let message = if leftovers.is_empty() {
            "You don't have any leftovers logged right now.".to_string()
        } else {
            let names: Vec<&str> = leftovers.iter().map(|l| l.name.as_str()).collect();
            format!("You currently have: {}.", names.join(", "))
        };
        Ok(AgentResponse::ok(message).with_data(json!({ "leftovers": leftovers })).into())
    }
}

#[async_trait]
impl DomainAgent for ShoppingAgent {
    fn name(&self) -> AgentName {
        AgentName::Shopping
    }

    async fn process(&self, message: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let (text, _entities) = split_enriched(message);
        let lower = text.to_lowercase();
        if mentions(&lower, &["pantry", "leftover", "what do i have"]) && !lower.contains("list") {
            return self.pantry(ctx).await;
        }
        self.generate(text, None, ctx).await
    }

    async fn handoff(&self, _from: AgentName, payload: &Value, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let plan_id = payload.get("planId").and_then(Value::as_str).map(String::from);
        let request = handoff_request(payload).unwrap_or("Make a shopping list for my meal plan");
        self.generate(request, plan_id, ctx).await
    }
}
