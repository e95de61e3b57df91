//! Recipe Agent：网址 / 图片导入、已存菜谱检索、食材替换、烹饪问答
//!
//! 网址导入是分层降级：抓取页面 → JSON-LD 结构化提取 → 失败才让模型解析正文 → 校验必填字段 →
//! 缺营养时再调一次估算工具 → 附上来源 → 返回 save_recipe 动作。图片导入只有模型这一条路。

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::agents::{handoff_request, mentions, AgentBase, AgentDeps, DomainAgent};
use crate::core::routing::{first_entity, split_enriched};
use crate::core::{
    ActionKind, AgentAction, AgentContext, AgentError, AgentName, AgentReply, AgentResponse, Entity, EntityType,
};
use crate::llm::{merge_usage, ImageInput, TokenUsage};
use crate::tools::{
    EstimateNutritionTool, ExtractStructuredRecipeTool, FetchPageTool, PageFetcher, SearchRecipesTool, ToolResult,
};

const MIN_INGREDIENTS_CHARS: usize = 10;
const MIN_INSTRUCTIONS_CHARS: usize = 20;
const MAX_PROMPT_PAGE_CHARS: usize = 12_000;

const PARSE_PROMPT: &str = r#"You extract recipes from web page text.
Reply with JSON only:
{"name": string, "ingredients": [string], "instructions": [string], "servings": number|null,
 "totalTimeMinutes": number|null, "cuisine": string|null}
If the page does not contain a recipe, reply {"name": ""}."#;

const IMAGE_PROMPT: &str = r#"You read recipes from photos of cookbooks, cards and screenshots.
Reply with JSON only:
{"name": string, "ingredients": [string], "instructions": [string], "servings": number|null}"#;

const SUBSTITUTION_PROMPT: &str = r#"You are a cooking assistant suggesting ingredient substitutions that respect the user's preferences.
Reply with JSON only:
{"message": string, "substitutions": [{"original": string, "substitute": string, "ratio": string, "notes": string}]}"#;

const STARTER_PROMPT: &str = r#"The user has no saved recipes yet. Suggest three simple starter recipes that fit their request and preferences.
Reply with JSON only: {"recipes": [{"name": string, "description": string}]}"#;

const QA_PROMPT: &str = "You are a friendly cooking assistant. Answer concisely. \
Use the search_recipes tool when the question is about the user's own saved recipes.";

/// (原料, 替代品, 比例)
const SUBSTITUTES: &[(&str, &str, &str)] = &[
    ("butter", "olive oil", "3/4 the amount"),
    ("buttermilk", "milk with 1 tbsp lemon juice per cup", "1:1"),
    ("egg", "1 tbsp ground flaxseed + 3 tbsp water", "per egg"),
    ("milk", "oat milk", "1:1"),
    ("sour cream", "plain greek yogurt", "1:1"),
    ("heavy cream", "coconut cream", "1:1"),
    ("sugar", "honey", "3/4 the amount, reduce liquid slightly"),
    ("soy sauce", "coconut aminos", "1:1"),
    ("breadcrumbs", "crushed rolled oats", "1:1"),
];

const STARTER_RECIPES: &[(&str, &str)] = &[
    ("Sheet-Pan Chicken and Vegetables", "One pan, 35 minutes, easy to scale for the week."),
    ("Black Bean Tacos", "Pantry-friendly weeknight dinner ready in 20 minutes."),
    ("Vegetable Fried Rice", "A good way to use leftover rice and vegetables."),
];

/// 字符串或字符串数组（模型与 JSON-LD 两种写法都接受）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextOrList {
    Text(String),
    List(Vec<String>),
}

impl Default for TextOrList {
    fn default() -> Self {
        TextOrList::Text(String::new())
    }
}

impl TextOrList {
    pub fn lines(&self) -> Vec<String> {
        match self {
            TextOrList::Text(s) => s.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect(),
            TextOrList::List(items) => items.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).map(String::from).collect(),
        }
    }

    pub fn char_len(&self) -> usize {
        self.lines().iter().map(|l| l.chars().count()).sum()
    }
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u32>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.and_then(|v| match v {
        Value::Number(n) => n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u32),
        Value::String(s) => s
            .split(|c: char| !c.is_ascii_digit())
            .find(|p| !p.is_empty())
            .and_then(|p| p.parse().ok()),
        _ => None,
    }))
}

/// 导入得到的菜谱（可能不完整）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedRecipe {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ingredients: TextOrList,
    #[serde(default)]
    pub instructions: TextOrList,
    #[serde(default, deserialize_with = "lenient_u32", skip_serializing_if = "Option::is_none")]
    pub servings: Option<u32>,
    #[serde(default, deserialize_with = "lenient_u32", skip_serializing_if = "Option::is_none")]
    pub total_time_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuisine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nutrition: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_via: Option<String>,
}

impl ImportedRecipe {
    /// 未达到最低要求的字段
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.ingredients.char_len() < MIN_INGREDIENTS_CHARS {
            missing.push("ingredients");
        }
        if self.instructions.char_len() < MIN_INSTRUCTIONS_CHARS {
            missing.push("instructions");
        }
        missing
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Substitution {
    original: String,
    substitute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ratio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    notes: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubstitutionReply {
    #[serde(default)]
    message: String,
    #[serde(default)]
    substitutions: Vec<Substitution>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StarterIdea {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct StarterReply {
    #[serde(default)]
    recipes: Vec<StarterIdea>,
}

enum RecipeTask {
    ImportImage(ImageInput),
    ImportUrl(String),
    Substitution,
    Search,
    Ask,
}

static URL_RE: OnceLock<Option<Regex>> = OnceLock::new();
static IMAGE_URL_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn find_url(text: &str) -> Option<String> {
    let re = URL_RE.get_or_init(|| Regex::new(r#"https?://[^\s<>"'()\[\]]+"#).ok());
    re.as_ref()?
        .find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', '!', '?']).to_string())
}

fn is_image_url(url: &str) -> bool {
    IMAGE_URL_RE
        .get_or_init(|| Regex::new(r"(?i)\.(jpe?g|png|webp|gif)(\?\S*)?$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(url))
}

fn triage(text: &str, entities: &[Entity], ctx: &AgentContext) -> RecipeTask {
    if let Some(image) = ctx
        .metadata
        .get("image")
        .and_then(|v| serde_json::from_value::<ImageInput>(v.clone()).ok())
    {
        return RecipeTask::ImportImage(image);
    }
    let url = find_url(text).or_else(|| first_entity(entities, EntityType::Url).and_then(find_url));
    if let Some(url) = url {
        return if is_image_url(&url) {
            RecipeTask::ImportImage(ImageInput::Url { url })
        } else {
            RecipeTask::ImportUrl(url)
        };
    }
    let lower = text.to_lowercase();
    if mentions(&lower, &["substitut", "instead of", "replace", "swap", "out of "]) {
        RecipeTask::Substitution
    } else if mentions(&lower, &["find", "search", "show me", "my recipes", "saved", "look up"]) {
        RecipeTask::Search
    } else {
        RecipeTask::Ask
    }
}

/// 检索词：优先用实体，否则去掉功能词
fn search_query(text: &str, entities: &[Entity]) -> String {
    for kind in [EntityType::RecipeName, EntityType::Ingredient, EntityType::Cuisine] {
        if let Some(v) = first_entity(entities, kind) {
            return v.to_string();
        }
    }
    const STOP: &[&str] = &[
        "find", "search", "show", "me", "my", "recipes", "recipe", "saved", "for", "with", "a", "the", "look", "up",
        "please", "any", "i", "have", "do",
    ];
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty() && !STOP.contains(&w.to_lowercase().as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct RecipeAgent {
    base: AgentBase,
}

impl RecipeAgent {
    pub fn new(deps: &AgentDeps, fetcher: Arc<dyn PageFetcher>, max_page_chars: usize) -> Self {
        let mut tools = deps.registry();
        tools.register(FetchPageTool::new(fetcher, max_page_chars));
        tools.register(ExtractStructuredRecipeTool::new());
        tools.register(EstimateNutritionTool::new(deps.repo.clone()));
        tools.register(SearchRecipesTool::new(deps.repo.clone()));
        Self {
            base: AgentBase::new(deps.client.clone(), tools),
        }
    }

    async fn import_url(&self, url: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let mut usage = None;
        let Some(page) = self.base.tool("fetch_page", json!({ "url": url }), ctx).await.into_data() else {
            return Ok(AgentResponse::failure(
                "I couldn't load that page. Please check the link and try again.",
                "Failed to fetch recipe page",
            )
            .into());
        };

        let structured = self
            .base
            .tool(
                "extract_structured_recipe",
                json!({ "jsonLd": page["jsonLd"], "html": page["html"] }),
                ctx,
            )
            .await
            .into_data()
            .and_then(|v| serde_json::from_value::<ImportedRecipe>(v).ok());

        let (recipe, via) = match structured {
            Some(r) => (r, "structured_data"),
            None => {
                let text: String = page["text"].as_str().unwrap_or_default().chars().take(MAX_PROMPT_PAGE_CHARS).collect();
                let prompt = format!("URL: {url}\n\nPage text:\n{text}");
                match self.base.ask_json::<ImportedRecipe>(PARSE_PROMPT, &prompt, ctx, &mut usage).await? {
                    Some(r) => (r, "ai"),
                    None => {
                        return Ok(AgentReply::new(
                            AgentResponse::failure(
                                "I couldn't find a recipe on that page.",
                                "Recipe could not be extracted",
                            ),
                            usage,
                        ))
                    }
                }
            }
        };
        self.finish_import(recipe, Some(url.to_string()), via, ctx, usage).await
    }

    async fn import_image(&self, image: &ImageInput, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let completion = self
            .base
            .client()
            .complete_with_image(IMAGE_PROMPT, "Extract the recipe in this image.", image, ctx)
            .await?;
        let usage = Some(completion.usage);
        let Some(recipe) = crate::core::parse_json_reply::<ImportedRecipe>(&completion.content) else {
            return Ok(AgentReply::new(
                AgentResponse::failure("I couldn't read a recipe from that image.", "Recipe could not be extracted"),
                usage,
            ));
        };
        let source = match image {
            ImageInput::Url { url } => Some(url.clone()),
            ImageInput::Base64 { .. } => None,
        };
        self.finish_import(recipe, source, "image", ctx, usage).await
    }

    /// 校验 → 补营养 → 附来源 → save_recipe
    async fn finish_import(
        &self,
        mut recipe: ImportedRecipe,
        source: Option<String>,
        via: &str,
        ctx: &AgentContext,
        usage: Option<TokenUsage>,
    ) -> Result<AgentReply, AgentError> {
        if source.is_some() {
            recipe.source_url = source;
        }
        recipe.imported_via = Some(via.to_string());

        let missing = recipe.missing_fields();
        if !missing.is_empty() {
            tracing::info!(?missing, via, "imported recipe failed validation");
            let response = AgentResponse::failure(
                format!(
                    "I found part of a recipe but it is missing {}. You can fill in the gaps and save it.",
                    missing.join(", ")
                ),
                "Recipe validation failed",
            )
            .with_data(json!({ "partialRecipe": recipe, "missingFields": missing }));
            return Ok(AgentReply::new(response, usage));
        }

        if recipe.nutrition.is_none() {
            let params = json!({
                "ingredients": recipe.ingredients.lines(),
                "servings": recipe.servings.unwrap_or(1),
            });
            recipe.nutrition = self.base.tool("estimate_nutrition", params, ctx).await.into_data();
        }

        let message = format!(
            "I imported \"{}\" ({} ingredients). Want me to save it to your recipes?",
            recipe.name.trim(),
            recipe.ingredients.lines().len()
        );
        let response = AgentResponse::ok(message)
            .with_data(json!({ "recipe": recipe }))
            .with_action(AgentAction::new(ActionKind::SaveRecipe, json!({ "recipe": recipe })));
        Ok(AgentReply::new(response, usage))
    }

    async fn search(&self, text: &str, entities: &[Entity], ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let query = search_query(text, entities);
        let result = self.base.tool("search_recipes", json!({ "query": query, "limit": 5 }), ctx).await;
        let recipes: Vec<Value> = result
            .into_data()
            .and_then(|d| d["recipes"].as_array().cloned())
            .unwrap_or_default();
        let message = if recipes.is_empty() {
            format!("I couldn't find any saved recipes matching \"{query}\".")
        } else {
            let names: Vec<&str> = recipes.iter().filter_map(|r| r["name"].as_str()).collect();
            format!("Here's what I found in your recipes: {}.", names.join(", "))
        };
        Ok(AgentResponse::ok(message)
            .with_data(json!({ "query": query, "recipes": recipes }))
            .into())
    }

    async fn substitution(&self, text: &str, entities: &[Entity], ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let mut usage = None;
        let prompt = match first_entity(entities, EntityType::Ingredient) {
            Some(ingredient) => format!("{text}\n\nIngredient to replace: {ingredient}"),
            None => text.to_string(),
        };
        let reply = self
            .base
            .ask_json::<SubstitutionReply>(SUBSTITUTION_PROMPT, &prompt, ctx, &mut usage)
            .await?
            .filter(|r| !r.substitutions.is_empty());

        let (message, substitutions) = match reply {
            Some(r) => {
                let message = if r.message.trim().is_empty() {
                    describe_substitutions(&r.substitutions)
                } else {
                    r.message
                };
                (message, r.substitutions)
            }
            None => {
                let lower = prompt.to_lowercase();
                let found: Vec<Substitution> = SUBSTITUTES
                    .iter()
                    .filter(|(original, _, _)| lower.contains(original))
                    .map(|(original, substitute, ratio)| Substitution {
                        original: original.to_string(),
                        substitute: substitute.to_string(),
                        ratio: Some(ratio.to_string()),
                        notes: None,
                    })
                    .collect();
                if found.is_empty() {
                    ("I don't have a reliable substitute for that. Which ingredient would you like to replace?".to_string(), found)
                } else {
                    (describe_substitutions(&found), found)
                }
            }
        };
        Ok(AgentReply::new(
            AgentResponse::ok(message).with_data(json!({ "substitutions": substitutions })),
            usage,
        ))
    }

    /// 烹饪问答：允许模型调用 search_recipes，拿到结果后再补全一次
    async fn answer(&self, text: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let schemas = self.base.tools().schemas_for(&["search_recipes"]);
        let first = self.base.client().complete_with_tools(QA_PROMPT, text, ctx, &schemas).await?;
        let mut usage = Some(first.usage.clone());
        if first.tool_calls.is_empty() {
            return Ok(AgentReply::new(AgentResponse::ok(first.content), usage));
        }

        // 只执行本轮提供给模型的工具
        let mut results = Vec::new();
        for call in &first.tool_calls {
            let result = if schemas.iter().any(|s| s.name == call.name) {
                self.base.tool(&call.name, call.arguments.clone(), ctx).await
            } else {
                tracing::warn!(tool = %call.name, "model requested a tool that was not offered");
                ToolResult::err(format!("Tool {} not offered", call.name))
            };
            results.push(json!({ "tool": call.name, "result": result }));
        }
        let follow_up = format!(
            "{text}\n\nTool results:\n{}",
            serde_json::to_string_pretty(&results).unwrap_or_default()
        );
        let second = self.base.client().complete(QA_PROMPT, &follow_up, ctx).await?;
        usage = merge_usage(usage, Some(&second.usage));
        Ok(AgentReply::new(
            AgentResponse::ok(second.content).with_data(json!({ "toolResults": results })),
            usage,
        ))
    }

    /// 用户还没有菜谱时给出入门建议
    async fn starters(&self, from: AgentName, request: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let mut usage = None;
        let prompt = format!("Request: {request}");
        let ideas = match self.base.ask_json::<StarterReply>(STARTER_PROMPT, &prompt, ctx, &mut usage).await? {
            Some(r) if !r.recipes.is_empty() => r.recipes,
            _ => STARTER_RECIPES
                .iter()
                .map(|(name, description)| StarterIdea {
                    name: name.to_string(),
                    description: description.to_string(),
                })
                .collect(),
        };
        let names: Vec<&str> = ideas.iter().map(|i| i.name.as_str()).collect();
        let message = format!(
            "You don't have any saved recipes yet. A few easy ones to start with: {}. Send me a recipe link or photo and I'll import it.",
            names.join(", ")
        );
        Ok(AgentReply::new(
            AgentResponse::ok(message).with_data(json!({ "suggestions": ideas, "requestedBy": from })),
            usage,
        ))
    }
}

fn describe_substitutions(items: &[Substitution]) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|s| match &s.ratio {
            Some(r) => format!("{} → {} ({r})", s.original, s.substitute),
            None => format!("{} → {}", s.original, s.substitute),
        })
        .collect();
    format!("You can swap {}.", parts.join("; "))
}

#[async_trait]
impl DomainAgent for RecipeAgent {
    fn name(&self) -> AgentName {
        AgentName::Recipe
    }

    async fn process(&self, message: &str, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        let (text, entities) = split_enriched(message);
        match triage(text, &entities, ctx) {
            RecipeTask::ImportImage(image) => self.import_image(&image, ctx).await,
            RecipeTask::ImportUrl(url) => self.import_url(&url, ctx).await,
            RecipeTask::Substitution => self.substitution(text, &entities, ctx).await,
            RecipeTask::Search => self.search(text, &entities, ctx).await,
            RecipeTask::Ask => self.answer(text, ctx).await,
        }
    }

    async fn handoff(&self, from: AgentName, payload: &Value, ctx: &AgentContext) -> Result<AgentReply, AgentError> {
        if let Some(url) = payload.get("url").and_then(Value::as_str) {
            return self.import_url(url, ctx).await;
        }
        let request = handoff_request(payload).unwrap_or("Suggest recipes to get started");
        self.starters(from, request, ctx).await
    }
}
