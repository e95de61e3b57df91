//! Planning Agent：多日餐单、单餐推荐、剩菜利用
//!
//! 没有已存菜谱时不做计划，而是把本轮转给 Recipe Agent（nextAgent = recipe）。
//! 模型输出无法解析时，用确定性的轮换 / 选择结果兜底。

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::{handoff_request, mentions, AgentBase, AgentDeps, DomainAgent};
use crate::core::routing::{first_entity, split_enriched};
use crate::core::{
    ActionKind, AgentAction, AgentContext, AgentError, AgentName, AgentReply, AgentResponse, EntityType, Leftover,
};
use crate::repository::{MealRecord, Recipe};
use crate::tools::{LeftoversTool, MealHistoryTool, RecentRecipesTool};

const DEFAULT_PLAN_DAYS: u32 = 7;
const MAX_PLAN_DAYS: u32 = 14;
const MEAL_TYPES: [&str; 3] = ["breakfast", "lunch", "dinner"];

const PLAN_PROMPT: &str = r#"You are a meal planner. Build a plan using ONLY the recipes listed. Avoid repeating a recipe on consecutive days and avoid what the user ate recently.
Reply with JSON only:
{"name": string, "days": [{"date": "YYYY-MM-DD", "meals": [{"mealType": string, "recipeId": string, "recipeName": string}]}], "notes": string}"#;

const SUGGEST_PROMPT: &str = r#"Pick ONE of the listed recipes for the user's next meal. Prefer something they have not eaten recently.
Reply with JSON only: {"recipeId": string, "recipeName": string, "reason": string}"#;

const LEFTOVER_PROMPT: &str = r#"Suggest meals that use up the listed leftovers, soonest-expiring first. You may use the user's recipes or simple ideas.
Reply with JSON only: {"message": string, "suggestions": [{"recipeName": string, "usesLeftovers": [string], "reason": string}]}"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedMeal {
    pub meal_type: String,
    #[serde(default)]
    pub recipe_id: Option<String>,
    pub recipe_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDay {
    pub date: NaiveDate,
    #[serde(default)]
    pub meals: Vec<PlannedMeal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealPlanDraft {
    #[serde(default)]
    pub name: String,
    pub days: Vec<PlanDay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MealSuggestion {
    #[serde(default)]
    recipe_id: Option<String>,
    recipe_name: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeftoverIdea {
    recipe_name: String,
    #[serde(default)]
    uses_leftovers: Vec<String>,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct LeftoverReply {
    #[serde(default)]
    message: String,
    #[serde(default)]
    suggestions: Vec<LeftoverIdea>,
}

enum PlanningTask {
    Leftovers,
    Plan { days: u32, meal_types: Vec<String> },
    Suggest,
}

static DAYS_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn requested_days(lower: &str) -> Option<u32> {
    let re = DAYS_RE.get_or_init(|| Regex::new(r"(\d{1,2})\s*-?\s*days?").ok());
    re.as_ref()?
        .captures(lower)
        .and_then(|c| c.get(1)?.as_str().parse::<u32>().ok())
        .map(|d| d.clamp(1, MAX_PLAN_DAYS))
}

fn requested_meal_types(lower: &str, entity: Option<&str>) -> Vec<String> {
    let source = match entity {
        Some(e) => format!("{lower} {}", e.to_lowercase()),
        None => lower.to_string(),
    };
    let found: Vec<String> = MEAL_TYPES
        .iter()
        .filter(|m| source.contains(*m))
        .map(|m| m.to_string())
        .collect();
    if found.is_empty() {
        vec!["dinner".to_string()]
    } else {
        found
    }
}

fn triage(text: &str, meal_type_entity: Option<&str>) -> PlanningTask {
    let lower = text.to_lowercase();
    if mentions(&lower, &["leftover", "use up", "left over"]) {
        return PlanningTask::Leftovers;
    }
    if mentions(&lower, &["plan", "week", "schedule", "days", "menu"]) {
        let days = requested_days(&lower).unwrap_or(if lower.contains("weekend") { 2 } else { DEFAULT_PLAN_DAYS });
        return PlanningTask::Plan {
            days,
            meal_types: requested_meal_types(&lower, meal_type_entity),
        };
    }
    PlanningTask::Suggest
}

/// 确定性兜底：按菜谱顺序轮换，跳过最近吃过的（全都吃过时不跳过）
pub fn rotation_plan(recipes: &[Recipe], recent: &[MealRecord], start: NaiveDate, days: u32, meal_types: &[String]) -> MealPlanDraft {
    let fresh: Vec<&Recipe> = recipes
        .iter()
        .filter(|r| !recent.iter().any(|m| m.recipe_name.eq_ignore_ascii_case(&r.name)))
        .collect();
    let pool: Vec<&Recipe> = if fresh.is_empty() { recipes.iter().collect() } else { fresh };
    let days = if pool.is_empty() { 0 } else { days };

    let mut slot = 0usize;
    let plan_days = (0..days)
        .map(|d| {
            let meals = meal_types
                .iter()
                .map(|meal_type| {
                    let recipe = pool[slot % pool.len()];
                    slot += 1;
                    PlannedMeal {
                        meal_type: meal_type.clone(),
                        recipe_id: Some(recipe.id.clone()),
                        recipe_name: recipe.name.clone(),
                    }
                })
                .collect();
            PlanDay {
                date: start + ChronoDuration::days(i64::from(d)),
                meals,
            }
        })
        .collect();
    MealPlanDraft {
        name: format!("{days}-day plan"),
        days: plan_days,
        notes: None,
    }
}

fn recipe_catalog(recipes: &[Recipe]) -> String {
    recipes
        .iter()
        .map(|r| match &r.cuisine {
            Some(c) => format!("- {} | {} ({c})", r.id, r.name),
            None => format!("- {} | {}", r.id, r.name),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn recent_names(history: &[MealRecord]) -> String {
    if history.is_empty() {
        return "none".to_string();
    }
    history.iter().map(|m| m.recipe_name.as_str()).collect::<Vec<_>>().join(", ")
}

pub struct PlanningAgent {
    base: AgentBase,
}

impl PlanningAgent {
    pub fn new(deps: &AgentDeps) -> Self {
        let mut tools = deps.registry();
        tools.register(RecentRecipesTool::new(deps.repo.clone()));
        tools.register(MealHistoryTool::new(deps.repo.clone()));
        tools.register(LeftoversTool::new(deps.repo.clone()));
        Self {
            base: AgentBase::new(deps.client.clone(), tools),
        }
    }

    async fn recipes(&self, ctx: &AgentContext) -> Vec<Recipe> {
        self.base
            .tool("get_recent_recipes", json!({ "limit": 20 }), ctx)
            .await
            .into_data()
            .and_then(|d| serde_json::from_value(d["recipes"].clone()).ok())
            .unwrap_or_default()
    }

    async fn history(&self, days: u32, ctx: &AgentContext) -> Vec<MealRecord> {
        self.base
            .tool("get_meal_history", json!({ "days": days }), ctx)
            .await
            .into_data()
            .and_then(|d| serde_json::from_value(d["meals"].clone()).ok())
            .unwrap_or_default()
    }

    fn no_recipes(request: &str) -> AgentReply {
        AgentResponse::redirect(
            "You don't have any saved recipes yet, so let's find a few before planning.",
            AgentName::Recipe,
        )
        .with_data(json!({ "reason": "no_recipes", "request": request }))
        .into()
    }

    async fn plan(&self, request: &str, days: u32, meal_types: &[String], ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let recipes = self.recipes(ctx).await;
        if recipes.is_empty() {
            return Ok(Self::no_recipes(request));
        }
        let history = self.history(7, ctx).await;
        let start = Utc::now().date_naive() + ChronoDuration::days(1);

        let mut usage = None;
        let prompt = format!(
            "Request: {request}\nStart date: {start}\nDays: {days}\nMeals per day: {}\n\nRecipes (id | name):\n{}\n\nEaten recently: {}",
            meal_types.join(", "),
            recipe_catalog(&recipes),
            recent_names(&history),
        );
        let plan = match self.base.ask_json::<MealPlanDraft>(PLAN_PROMPT, &prompt, ctx, &mut usage).await? {
            Some(p) if !p.days.is_empty() => p,
            _ => rotation_plan(&recipes, &history, start, days, meal_types),
        };
        let meals: usize = plan.days.iter().map(|d| d.meals.len()).sum();
        let message = format!(
            "Here's a {}-day plan with {meals} meals starting {}. Want me to save it?",
            plan.days.len(),
            plan.days.first().map(|d| d.date).unwrap_or(start)
        );
        let response = AgentResponse::ok(message)
            .with_data(json!({ "plan": plan }))
            .with_action(AgentAction::new(ActionKind::SaveMealPlan, json!({ "plan": plan })));
        Ok(AgentReply::new(response, usage))
    }

    async fn suggest(&self, request: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let recipes = self.recipes(ctx).await;
        if recipes.is_empty() {
            return Ok(Self::no_recipes(request));
        }
        let history = self.history(3, ctx).await;
        let mut usage = None;
        let prompt = format!(
            "Request: {request}\n\nRecipes (id | name):\n{}\n\nEaten recently: {}",
            recipe_catalog(&recipes),
            recent_names(&history)
        );
        let known = |s: &MealSuggestion| recipes.iter().any(|r| r.name.eq_ignore_ascii_case(&s.recipe_name));
        let suggestion = match self.base.ask_json::<MealSuggestion>(SUGGEST_PROMPT, &prompt, ctx, &mut usage).await? {
            Some(s) if known(&s) => s,
            _ => {
                let pick = recipes
                    .iter()
                    .find(|r| !history.iter().any(|m| m.recipe_name.eq_ignore_ascii_case(&r.name)))
                    .unwrap_or(&recipes[0]);
                MealSuggestion {
                    recipe_id: Some(pick.id.clone()),
                    recipe_name: pick.name.clone(),
                    reason: "You haven't had it in the last few days.".to_string(),
                }
            }
        };
        let message = format!("How about {}? {}", suggestion.recipe_name, suggestion.reason).trim().to_string();
        Ok(AgentReply::new(
            AgentResponse::ok(message).with_data(json!({ "suggestion": suggestion })),
            usage,
        ))
    }

    async fn leftovers(&self, request: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let mut leftovers: Vec<Leftover> = self
            .base
            .tool("get_leftovers", Value::Null, ctx)
            .await
            .into_data()
            .and_then(|d| serde_json::from_value(d["leftovers"].clone()).ok())
            .unwrap_or_default();
        if leftovers.is_empty() {
            return Ok(AgentResponse::ok("You don't have any leftovers logged right now.")
                .with_data(json!({ "leftovers": [] }))
                .into());
        }
        // 最早过期的排前面，无过期日期的排最后
        leftovers.sort_by_key(|l| l.expires_on.unwrap_or(NaiveDate::MAX));
        let recipes = self.recipes(ctx).await;

        let mut usage = None;
        let listing: Vec<String> = leftovers
            .iter()
            .map(|l| match l.expires_on {
                Some(d) => format!("- {} (expires {d})", l.name),
                None => format!("- {}", l.name),
            })
            .collect();
        let prompt = format!(
            "Request: {request}\n\nLeftovers:\n{}\n\nUser recipes (id | name):\n{}",
            listing.join("\n"),
            recipe_catalog(&recipes)
        );
        let reply = self.base.ask_json::<LeftoverReply>(LEFTOVER_PROMPT, &prompt, ctx, &mut usage).await?;
        let (message, suggestions) = match reply {
            Some(r) if !r.suggestions.is_empty() => {
                let message = if r.message.trim().is_empty() {
                    format!("Try {} to use up your leftovers.", r.suggestions[0].recipe_name)
                } else {
                    r.message
                };
                (message, r.suggestions)
            }
            _ => leftover_fallback(&leftovers, &recipes),
        };
        Ok(AgentReply::new(
            AgentResponse::ok(message).with_data(json!({ "leftovers": leftovers, "suggestions": suggestions })),
            usage,
        ))
    }
}

/// 配料里提到剩菜名称的菜谱优先；都不匹配时提示先吃快过期的
fn leftover_fallback(leftovers: &[Leftover], recipes: &[Recipe]) -> (String, Vec<LeftoverIdea>) {
    let ideas: Vec<LeftoverIdea> = recipes
        .iter()
        .filter_map(|r| {
            let uses: Vec<String> = leftovers
                .iter()
                .filter(|l| {
                    let name = l.name.to_lowercase();
                    r.ingredients.iter().any(|i| i.to_lowercase().contains(&name))
                })
                .map(|l| l.name.clone())
                .collect();
            (!uses.is_empty()).then(|| LeftoverIdea {
                recipe_name: r.name.clone(),
                uses_leftovers: uses,
                reason: "Uses ingredients you already have.".to_string(),
            })
        })
        .collect();
    let message = match ideas.first() {
        Some(first) => format!("{} would use up your {}.", first.recipe_name, first.uses_leftovers.join(", ")),
        None => format!("Use your {} first, it expires soonest.", leftovers[0].name),
    };
    (message, ideas)
}

#[async_trait]
impl DomainAgent for PlanningAgent {
    fn name(&self) -> AgentName {
        AgentName::Planning
    }

    async fn process(&self, message: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let (text, entities) = split_enriched(message);
        match triage(text, first_entity(&entities, EntityType::MealType)) {
            PlanningTask::Leftovers => self.leftovers(text, ctx).await,
            PlanningTask::Plan { days, meal_types } => self.plan(text, days, &meal_types, ctx).await,
            PlanningTask::Suggest => self.suggest(text, ctx).await,
        }
    }

    /// 被转交时总是产出多日计划（例如 Shopping 缺少计划时）
    async fn handoff(&self, _from: AgentName, payload: &Value, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let request = handoff_request(payload).unwrap_or("Plan my meals for the week");
        let lower = request.to_lowercase();
        let days = requested_days(&lower).unwrap_or(DEFAULT_PLAN_DAYS);
        self.plan(request, days, &requested_meal_types(&lower, None), ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CompletionClient, ScriptedBackend};
    use crate::repository::InMemoryRepository;
    use std::sync::Arc;

    fn agent(backend: Arc<ScriptedBackend>, repo: Arc<InMemoryRepository>) -> PlanningAgent {
        let client = Arc::new(CompletionClient::new(backend, "gpt-4o-mini"));
        PlanningAgent::new(&AgentDeps::new(client, repo))
    }

    async fn repo_with(names: &[&str]) -> Arc<InMemoryRepository> {
        let repo = Arc::new(InMemoryRepository::new());
        for (i, name) in names.iter().enumerate() {
            repo.add_recipe("u1", Recipe::new(&format!("r{i}"), name)).await;
        }
        repo
    }

    #[tokio::test]
    async fn test_plan_without_recipes_redirects_to_recipe() {
        let backend = Arc::new(ScriptedBackend::new());
        let a = agent(backend.clone(), Arc::new(InMemoryRepository::new()));
        let r = a.process("plan my week", &AgentContext::new("u1")).await.unwrap().response;
        assert!(!r.success);
        assert_eq!(r.next_agent, Some(AgentName::Recipe));
        assert_eq!(r.data.unwrap()["request"], json!("plan my week"));
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_plan_falls_back_to_rotation() {
        let backend = Arc::new(ScriptedBackend::new().reply("Sure, here's a plan: Monday tacos..."));
        let a = agent(backend, repo_with(&["Tacos", "Ramen", "Curry"]).await);
        let reply = a.process("plan 3 days of lunch and dinner", &AgentContext::new("u1")).await.unwrap();
        let r = reply.response;
        assert!(r.success);
        assert_eq!(r.actions[0].kind, ActionKind::SaveMealPlan);
        let days = r.data.unwrap()["plan"]["days"].as_array().unwrap().clone();
        assert_eq!(days.len(), 3);
        assert_eq!(days[0]["meals"].as_array().unwrap().len(), 2);
        assert!(reply.usage.is_some());
    }

    #[test]
    fn test_rotation_skips_recent_meals() {
        let recipes = vec![Recipe::new("r1", "Tacos"), Recipe::new("r2", "Ramen")];
        let today = NaiveDate::from_ymd_opt(2026, 5, 4).unwrap();
        let recent = vec![MealRecord {
            date: today,
            meal_type: "dinner".into(),
            recipe_id: None,
            recipe_name: "tacos".into(),
            nutrition: None,
        }];
        let plan = rotation_plan(&recipes, &recent, today, 2, &["dinner".to_string()]);
        assert!(plan.days.iter().all(|d| d.meals[0].recipe_name == "Ramen"));
        assert_eq!(plan.days[1].date, today + ChronoDuration::days(1));
    }

    #[tokio::test]
    async fn test_suggest_ignores_unknown_recipe_from_model() {
        let backend = Arc::new(ScriptedBackend::new().reply(r#"{"recipeName": "Lobster Thermidor", "reason": "fancy"}"#));
        let a = agent(backend, repo_with(&["Tacos"]).await);
        let r = a.process("what should I eat tonight?", &AgentContext::new("u1")).await.unwrap().response;
        assert!(r.message.contains("Tacos"));
    }

    #[tokio::test]
    async fn test_leftovers_fallback_matches_ingredients() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.add_recipe("u1", Recipe::new("r1", "Fried Rice").with_ingredients(&["2 cups cooked rice", "2 eggs"]))
            .await;
        repo.add_leftover(
            "u1",
            Leftover {
                id: "l1".into(),
                name: "rice".into(),
                quantity: None,
                expires_on: None,
                used: false,
            },
        )
        .await;
        let a = agent(Arc::new(ScriptedBackend::new().reply("no idea")), repo);
        let r = a.process("what can I do with my leftovers", &AgentContext::new("u1")).await.unwrap().response;
        assert!(r.message.contains("Fried Rice"));
    }

    #[test]
    fn test_triage() {
        assert!(matches!(triage("plan my weekend", None), PlanningTask::Plan { days: 2, .. }));
        assert!(matches!(triage("use up leftovers", None), PlanningTask::Leftovers));
        assert!(matches!(triage("dinner idea?", None), PlanningTask::Suggest));
    }
}
