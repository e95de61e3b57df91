//! Nutrition Agent：菜谱营养分析、阶段摄入汇总、饮食限制检查、更健康的替换

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::{mentions, AgentBase, AgentDeps, DomainAgent};
use crate::core::routing::{first_entity, split_enriched};
use crate::core::{AgentContext, AgentError, AgentName, AgentReply, AgentResponse, Entity, EntityType, UserPreferences};
use crate::llm::TokenUsage;
use crate::repository::{MealRecord, Nutrition};
use crate::tools::{DietaryProfileTool, EstimateNutritionTool, MealHistoryTool, RecipeNutritionTool};

const ANALYSIS_PROMPT: &str = r#"You are a nutrition coach. Comment briefly on the recipe's per-serving nutrition relative to the user's goals.
Reply with JSON only: {"message": string, "highlights": [string]}"#;

const SUMMARY_PROMPT: &str = r#"You are a nutrition coach. Given the user's intake totals, give a short encouraging summary with at most three practical tips.
Reply with JSON only: {"message": string, "tips": [string]}"#;

const SWAP_PROMPT: &str = r#"Suggest healthier ingredient swaps that keep the dish enjoyable and respect the user's restrictions.
Reply with JSON only: {"message": string, "swaps": [{"original": string, "substitute": string, "benefit": string}]}"#;

const QA_PROMPT: &str = "You are a nutrition assistant. Answer concisely and avoid medical claims.";

/// (饮食限制关键词, 冲突配料)
const DIET_RULES: &[(&str, &[&str])] = &[
    (
        "vegetarian",
        &["chicken", "beef", "pork", "bacon", "ham", "lamb", "turkey", "fish", "salmon", "tuna", "shrimp", "anchov", "gelatin"],
    ),
    (
        "vegan",
        &[
            "chicken", "beef", "pork", "bacon", "ham", "lamb", "turkey", "fish", "salmon", "tuna", "shrimp", "anchov",
            "gelatin", "egg", "milk", "cheese", "butter", "cream", "yogurt", "honey",
        ],
    ),
    ("gluten", &["flour", "bread", "pasta", "wheat", "barley", "rye", "soy sauce", "breadcrumb", "couscous"]),
    ("dairy", &["milk", "cheese", "butter", "cream", "yogurt"]),
];

const HEALTHIER: &[(&str, &str, &str)] = &[
    ("sour cream", "plain greek yogurt", "more protein, less fat"),
    ("white rice", "brown rice", "more fiber"),
    ("butter", "olive oil", "unsaturated fat instead of saturated"),
    ("heavy cream", "half-and-half", "about half the fat"),
    ("ground beef", "ground turkey", "leaner protein"),
    ("pasta", "whole wheat pasta", "more fiber"),
    ("sugar", "mashed banana", "less added sugar"),
    ("mayonnaise", "mashed avocado", "healthier fats"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Commentary {
    #[serde(default)]
    message: String,
    #[serde(default, alias = "tips")]
    highlights: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Swap {
    original: String,
    substitute: String,
    #[serde(default)]
    benefit: String,
}

#[derive(Debug, Deserialize)]
struct SwapReply {
    #[serde(default)]
    message: String,
    #[serde(default)]
    swaps: Vec<Swap>,
}

/// 与饮食档案冲突的配料
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DietIssue {
    pub ingredient: String,
    pub reason: String,
}

enum NutritionTask {
    Swap,
    DietCheck,
    Summary { days: u32 },
    Analyze,
}

static DAYS_RE: OnceLock<Option<Regex>> = OnceLock::new();
static TARGET_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn summary_days(lower: &str) -> Option<u32> {
    if lower.contains("today") {
        return Some(1);
    }
    let explicit = DAYS_RE
        .get_or_init(|| Regex::new(r"(?:last|past)\s+(\d{1,3})\s+days?").ok())
        .as_ref()
        .and_then(|re| re.captures(lower))
        .and_then(|c| c.get(1)?.as_str().parse::<u32>().ok());
    if explicit.is_some() {
        return explicit.map(|d| d.clamp(1, 90));
    }
    if lower.contains("month") {
        Some(30)
    } else if mentions(lower, &["week", "intake", "so far", "how am i doing", "summary", "logged"]) {
        Some(7)
    } else {
        None
    }
}

fn triage(lower: &str, entities: &[Entity]) -> NutritionTask {
    if mentions(lower, &["healthier", "lighter", "swap", "substitut", "lower calorie", "less fat"]) {
        NutritionTask::Swap
    } else if mentions(lower, &["can i eat", "allerg", "compatible", "safe for", "ok for", "suitable", "vegan", "vegetarian", "gluten", "dairy"])
        || (first_entity(entities, EntityType::Dietary).is_some() && lower.contains('?'))
    {
        NutritionTask::DietCheck
    } else if let Some(days) = summary_days(lower) {
        NutritionTask::Summary { days }
    } else {
        NutritionTask::Analyze
    }
}

/// 检查配料与饮食限制 / 过敏 / 不喜欢的食材的冲突
pub fn diet_issues(ingredients: &[String], prefs: &UserPreferences, extra_diets: &[String]) -> Vec<DietIssue> {
    let lines: Vec<String> = ingredients.iter().map(|i| i.to_lowercase()).collect();
    let mut issues = Vec::new();
    let mut push = |ingredient: &str, reason: String| {
        if !issues.iter().any(|i: &DietIssue| i.ingredient == ingredient && i.reason == reason) {
            issues.push(DietIssue {
                ingredient: ingredient.to_string(),
                reason,
            });
        }
    };

    for diet in prefs.dietary_restrictions.iter().chain(extra_diets) {
        let diet_lower = diet.to_lowercase();
        for (key, conflicts) in DIET_RULES {
            if !diet_lower.contains(key) {
                continue;
            }
            for (line, original) in lines.iter().zip(ingredients) {
                if conflicts.iter().any(|c| line.contains(c)) {
                    push(original.as_str(), format!("not {diet}"));
                }
            }
        }
    }
    for allergy in &prefs.allergies {
        let a = allergy.to_lowercase();
        for (line, original) in lines.iter().zip(ingredients) {
            if line.contains(&a) {
                push(original.as_str(), format!("allergy: {allergy}"));
            }
        }
    }
    for disliked in &prefs.disliked_ingredients {
        let d = disliked.to_lowercase();
        for (line, original) in lines.iter().zip(ingredients) {
            if line.contains(&d) {
                push(original.as_str(), format!("you dislike {disliked}"));
            }
        }
    }
    issues
}

fn totals(meals: &[MealRecord]) -> (Nutrition, usize) {
    meals
        .iter()
        .filter_map(|m| m.nutrition)
        .fold((Nutrition::default(), 0), |(acc, n), next| (acc.add(&next), n + 1))
}

fn describe(name: &str, n: &Nutrition) -> String {
    format!(
        "{name} has about {:.0} kcal per serving ({:.0} g protein, {:.0} g carbs, {:.0} g fat).",
        n.calories, n.protein_g, n.carbs_g, n.fat_g
    )
}

pub struct NutritionAgent {
    base: AgentBase,
}

impl NutritionAgent {
    pub fn new(deps: &AgentDeps) -> Self {
        let mut tools = deps.registry();
        tools.register(RecipeNutritionTool::new(deps.repo.clone()));
        tools.register(MealHistoryTool::new(deps.repo.clone()));
        tools.register(DietaryProfileTool::new());
        tools.register(EstimateNutritionTool::new(deps.repo.clone()));
        Self {
            base: AgentBase::new(deps.client.clone(), tools),
        }
    }

    /// 找到消息所指的菜谱：实体 → 最近菜谱名 → 「of / in / for X」
    async fn resolve_recipe(&self, lower: &str, entities: &[Entity], ctx: &AgentContext) -> Option<Value> {
        let mut candidates: Vec<String> = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::RecipeName)
            .map(|e| e.value.clone())
            .collect();
        candidates.extend(
            ctx.memory
                .recent_recipes
                .iter()
                .filter(|r| lower.contains(&r.name.to_lowercase()))
                .map(|r| r.id.clone()),
        );
        let tail = TARGET_RE
            .get_or_init(|| Regex::new(r"(?:\bof|\bin|\bfor)\s+(?:the\s+|my\s+|this\s+)?([a-z][a-z '\-]+)").ok())
            .as_ref()
            .and_then(|re| re.captures(lower))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());
        candidates.extend(tail);

        for candidate in candidates {
            if let Some(found) = self
                .base
                .tool("get_recipe_nutrition", json!({ "recipe": candidate }), ctx)
                .await
                .into_data()
            {
                return Some(found);
            }
        }
        None
    }

    async fn answer(&self, text: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let mut usage = None;
        let content = self.base.ask(QA_PROMPT, text, ctx, &mut usage).await?;
        Ok(AgentReply::new(AgentResponse::ok(content), usage))
    }

    async fn analyze(&self, text: &str, entities: &[Entity], ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let lower = text.to_lowercase();
        let Some(found) = self.resolve_recipe(&lower, entities, ctx).await else {
            return self.answer(text, ctx).await;
        };
        let name = found["recipe"]["name"].as_str().unwrap_or("This recipe").to_string();
        let nutrition: Nutrition = serde_json::from_value(found["nutrition"].clone()).unwrap_or_default();

        let mut usage = None;
        let prompt = format!(
            "Question: {text}\nRecipe: {name}\nPer serving: {}\nEstimated: {}",
            found["nutrition"], found["estimated"]
        );
        let commentary = self
            .base
            .ask_json::<Commentary>(ANALYSIS_PROMPT, &prompt, ctx, &mut usage)
            .await?
            .filter(|c| !c.message.trim().is_empty());
        let mut message = describe(&name, &nutrition);
        if let Some(target) = ctx.memory.user_preferences.daily_calorie_target.filter(|t| *t > 0) {
            message.push_str(&format!(
                " That's {:.0}% of your {target} kcal daily target.",
                nutrition.calories / f64::from(target) * 100.0
            ));
        }
        let highlights = match commentary {
            Some(c) => {
                message = format!("{message} {}", c.message.trim());
                c.highlights
            }
            None => Vec::new(),
        };
        Ok(AgentReply::new(
            AgentResponse::ok(message).with_data(json!({
                "recipe": found["recipe"],
                "nutrition": nutrition,
                "estimated": found["estimated"],
                "highlights": highlights,
            })),
            usage,
        ))
    }

    async fn summary(&self, days: u32, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let meals: Vec<MealRecord> = self
            .base
            .tool("get_meal_history", json!({ "days": days }), ctx)
            .await
            .into_data()
            .and_then(|d| serde_json::from_value(d["meals"].clone()).ok())
            .unwrap_or_default();
        if meals.is_empty() {
            return Ok(AgentResponse::ok(format!(
                "You haven't logged any meals in the last {days} day(s). Log a few and I can summarize your intake."
            ))
            .with_data(json!({ "days": days, "meals": 0 }))
            .into());
        }

        let (total, counted) = totals(&meals);
        let daily_calories = (total.calories / f64::from(days)).round();
        let target = ctx.memory.user_preferences.daily_calorie_target;
        let mut message = format!(
            "In the last {days} day(s) you logged {} meals, averaging about {daily_calories:.0} kcal per day.",
            meals.len()
        );
        if let Some(t) = target {
            message.push_str(&format!(" Your target is {t} kcal."));
        }

        let mut usage: Option<TokenUsage> = None;
        let prompt = format!(
            "Days: {days}\nMeals logged: {}\nMeals with nutrition data: {counted}\nTotals: {}\nAverage kcal/day: {daily_calories}\nTarget kcal/day: {}",
            meals.len(),
            json!(total),
            target.map(|t| t.to_string()).unwrap_or_else(|| "not set".to_string()),
        );
        let tips = match self.base.ask_json::<Commentary>(SUMMARY_PROMPT, &prompt, ctx, &mut usage).await? {
            Some(c) => {
                if !c.message.trim().is_empty() {
                    message = format!("{message} {}", c.message.trim());
                }
                c.highlights
            }
            None => Vec::new(),
        };
        Ok(AgentReply::new(
            AgentResponse::ok(message).with_data(json!({
                "days": days,
                "meals": meals.len(),
                "totals": total,
                "dailyAverageCalories": daily_calories,
                "target": target,
                "tips": tips,
            })),
            usage,
        ))
    }

    async fn diet_check(&self, text: &str, entities: &[Entity], ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let lower = text.to_lowercase();
        let Some(found) = self.resolve_recipe(&lower, entities, ctx).await else {
            return self.answer(text, ctx).await;
        };
        let prefs: UserPreferences = self
            .base
            .tool("get_dietary_profile", Value::Null, ctx)
            .await
            .into_data()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();
        let extra: Vec<String> = entities
            .iter()
            .filter(|e| e.entity_type == EntityType::Dietary)
            .map(|e| e.value.clone())
            .collect();
        let ingredients: Vec<String> = serde_json::from_value(found["recipe"]["ingredients"].clone()).unwrap_or_default();
        let issues = diet_issues(&ingredients, &prefs, &extra);
        let name = found["recipe"]["name"].as_str().unwrap_or("This recipe");

        let message = if issues.is_empty() {
            format!("{name} looks compatible with your dietary profile.")
        } else {
            let parts: Vec<String> = issues.iter().map(|i| format!("{} ({})", i.ingredient, i.reason)).collect();
            format!("{name} has some conflicts: {}.", parts.join(", "))
        };
        Ok(AgentResponse::ok(message)
            .with_data(json!({ "recipe": found["recipe"], "compatible": issues.is_empty(), "issues": issues }))
            .into())
    }

    async fn swaps(&self, text: &str, entities: &[Entity], ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let mut usage = None;
        let reply = self
            .base
            .ask_json::<SwapReply>(SWAP_PROMPT, text, ctx, &mut usage)
            .await?
            .filter(|r| !r.swaps.is_empty());
        let (message, swaps) = match reply {
            Some(r) => (r.message, r.swaps),
            None => {
                let mut haystack = text.to_lowercase();
                if let Some(i) = first_entity(entities, EntityType::Ingredient) {
                    haystack.push(' ');
                    haystack.push_str(&i.to_lowercase());
                }
                let swaps: Vec<Swap> = HEALTHIER
                    .iter()
                    .filter(|(original, _, _)| haystack.contains(original))
                    .map(|(original, substitute, benefit)| Swap {
                        original: original.to_string(),
                        substitute: substitute.to_string(),
                        benefit: benefit.to_string(),
                    })
                    .collect();
                let message = if swaps.is_empty() {
                    "Tell me which ingredients you'd like to lighten up and I'll suggest swaps.".to_string()
                } else {
                    String::new()
                };
                (message, swaps)
            }
        };
        let message = if message.trim().is_empty() {
            let parts: Vec<String> = swaps
                .iter()
                .map(|s| format!("{} instead of {} ({})", s.substitute, s.original, s.benefit))
                .collect();
            format!("Try {}.", parts.join("; "))
        } else {
            message
        };
        Ok(AgentReply::new(
            AgentResponse::ok(message).with_data(json!({ "swaps": swaps })),
            usage,
        ))
    }
}

#[async_trait]
impl DomainAgent for NutritionAgent {
    fn name(&self) -> AgentName {
        AgentName::Nutrition
    }

    async fn process(&self, message: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let (text, entities) = split_enriched(message);
        match triage(&text.to_lowercase(), &entities) {
            NutritionTask::Swap => self.swaps(text, &entities, ctx).await,
            NutritionTask::DietCheck => self.diet_check(text, &entities, ctx).await,
            NutritionTask::Summary { days } => self.summary(days, ctx).await,
            NutritionTask::Analyze => self.analyze(text, &entities, ctx).await,
        }
    }

    /// 转交的数据里带菜谱配料时估算其营养，否则给出一周摄入汇总
    async fn handoff(&self, _from: AgentName, payload: &Value, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let recipe = &payload["recipe"];
        let ingredients: Vec<String> = match &recipe["ingredients"] {
            Value::Array(items) => items.iter().filter_map(Value::as_str).map(String::from).collect(),
            Value::String(s) => s.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect(),
            _ => Vec::new(),
        };
        if ingredients.is_empty() {
            return self.summary(7, ctx).await;
        }
        let servings = recipe["servings"].as_u64().unwrap_or(1);
        let result = self
            .base
            .tool("estimate_nutrition", json!({ "ingredients": ingredients, "servings": servings }), ctx)
            .await;
        let Some(estimate) = result.into_data() else {
            return Ok(AgentResponse::failure(
                "I couldn't estimate nutrition for that recipe.",
                "Nutrition estimate failed",
            )
            .into());
        };
        let nutrition: Nutrition = serde_json::from_value(estimate.clone()).unwrap_or_default();
        let name = recipe["name"].as_str().unwrap_or("This recipe");
        Ok(AgentResponse::ok(describe(name, &nutrition))
            .with_data(json!({ "nutrition": estimate, "estimated": true }))
            .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::routing::enrich_message;
    use crate::llm::{CompletionClient, ScriptedBackend};
    use crate::repository::{InMemoryRepository, Recipe};
    use chrono::Utc;
    use std::sync::Arc;

    fn agent(backend: Arc<ScriptedBackend>, repo: Arc<InMemoryRepository>) -> NutritionAgent {
        let client = Arc::new(CompletionClient::new(backend, "gpt-4o-mini"));
        NutritionAgent::new(&AgentDeps::new(client, repo))
    }

    fn nutrition(calories: f64) -> Nutrition {
        Nutrition {
            calories,
            protein_g: 10.0,
            carbs_g: 20.0,
            fat_g: 5.0,
        }
    }

    #[test]
    fn test_diet_issues() {
        let prefs = UserPreferences {
            dietary_restrictions: vec!["Vegetarian".into()],
            allergies: vec!["peanut".into()],
            ..Default::default()
        };
        let ingredients = vec!["2 chicken breasts".to_string(), "1 tbsp peanut butter".to_string(), "rice".to_string()];
        let issues = diet_issues(&ingredients, &prefs, &["gluten-free".to_string()]);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].ingredient, "2 chicken breasts");
        assert_eq!(issues[1].reason, "allergy: peanut");
    }

    #[tokio::test]
    async fn test_analyze_uses_recipe_entity_and_fallback_text() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.add_recipe("u1", Recipe::new("r1", "Chili").with_nutrition(nutrition(450.0))).await;
        let a = agent(Arc::new(ScriptedBackend::new().reply("great recipe!")), repo);
        let message = enrich_message(
            "how many calories?",
            AgentName::Nutrition,
            &[Entity::new(EntityType::RecipeName, "Chili")],
        );
        let r = a.process(&message, &AgentContext::new("u1")).await.unwrap().response;
        assert!(r.success);
        assert!(r.message.starts_with("Chili has about 450 kcal"));
        assert_eq!(r.data.unwrap()["estimated"], json!(false));
    }

    #[tokio::test]
    async fn test_summary_totals_history() {
        let repo = Arc::new(InMemoryRepository::new());
        let today = Utc::now().date_naive();
        for cal in [600.0, 800.0] {
            repo.add_meal(
                "u1",
                MealRecord {
                    date: today,
                    meal_type: "dinner".into(),
                    recipe_id: None,
                    recipe_name: "Soup".into(),
                    nutrition: Some(nutrition(cal)),
                },
            )
            .await;
        }
        let a = agent(Arc::new(ScriptedBackend::new().reply(r#"{"message": "Nice balance.", "tips": ["Drink water"]}"#)), repo);
        let reply = a.process("how am I doing today?", &AgentContext::new("u1")).await.unwrap();
        let data = reply.response.data.unwrap();
        assert_eq!(data["meals"], json!(2));
        assert_eq!(data["dailyAverageCalories"], json!(1400.0));
        assert_eq!(data["tips"], json!(["Drink water"]));
        assert!(reply.response.message.ends_with("Nice balance."));
    }

    #[tokio::test]
    async fn test_swap_fallback_table() {
        let a = agent(Arc::new(ScriptedBackend::new().reply("...")), Arc::new(InMemoryRepository::new()));
        let r = a
            .process("make my tacos healthier, they use sour cream", &AgentContext::new("u1"))
            .await
            .unwrap()
            .response;
        assert_eq!(r.data.unwrap()["swaps"][0]["substitute"], json!("plain greek yogurt"));
    }

    #[tokio::test]
    async fn test_handoff_estimates_recipe() {
        let a = agent(Arc::new(ScriptedBackend::new()), Arc::new(InMemoryRepository::new()));
        let payload = json!({"recipe": {"name": "Tacos", "ingredients": "8 tortillas\n1 lb beef", "servings": 2}});
        let r = a.handoff(AgentName::Recipe, &payload, &AgentContext::new("u1")).await.unwrap().response;
        assert!(r.message.starts_with("Tacos has about 120 kcal"));
    }
}
