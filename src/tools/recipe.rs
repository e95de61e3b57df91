//! Recipe Agent 的工具：抓取网页、JSON-LD 结构化提取、营养估算、已存菜谱检索

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use html2text::from_read;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::{AgentContext, AgentError};
use crate::repository::MealRepository;
use crate::tools::{AgentTool, ParamType, ToolParameter, ToolSchema};

/// 抓取网页原文（HTTP 或测试替身）
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, AgentError>;
}

/// reqwest 实现：带超时与浏览器 UA
pub struct HttpPageFetcher {
    client: Client,
}

impl HttpPageFetcher {
    pub fn new(timeout_secs: u64) -> Self {
        const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AgentError> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .send()
            .await
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(AgentError::ToolExecutionFailed(format!("HTTP {}", resp.status())));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read body: {e}")))?;
        Ok(body.trim_start_matches('\u{FEFF}').to_string())
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        s.chars().take(max).collect()
    } else {
        s.to_string()
    }
}

fn html_to_text(html: &str) -> String {
    match from_read(html.as_bytes(), 120) {
        Ok(text) if !text.trim().is_empty() => text,
        _ => html.to_string(),
    }
}

/// fetch_page：抓取页面，返回截断后的 html 与可读文本
///
/// JSON-LD 块在截断前从完整页面取出，单独放在 jsonLd 字段；正文很长的页面也不会丢结构化数据。
pub struct FetchPageTool {
    schema: ToolSchema,
    fetcher: Arc<dyn PageFetcher>,
    max_chars: usize,
}

impl FetchPageTool {
    pub fn new(fetcher: Arc<dyn PageFetcher>, max_chars: usize) -> Self {
        Self {
            schema: ToolSchema::new("fetch_page", "Download a recipe web page and return its HTML and readable text")
                .param(ToolParameter::required("url", ParamType::String, "http(s) URL of the page")),
            fetcher,
            max_chars,
        }
    }
}

#[async_trait]
impl AgentTool for FetchPageTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value, _ctx: &AgentContext) -> Result<Value, AgentError> {
        let url = params["url"].as_str().unwrap_or_default().trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(AgentError::InvalidArguments(format!("Not an http(s) URL: {url}")));
        }
        tracing::info!(url = %url, "fetching recipe page");
        let html = self.fetcher.fetch(url).await?;
        let text = html_to_text(&html);
        Ok(json!({
            "url": url,
            "jsonLd": ld_json_blocks(&html),
            "html": truncate_chars(&html, self.max_chars),
            "text": truncate_chars(&text, self.max_chars),
        }))
    }
}

static LD_JSON_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn ld_json_blocks(html: &str) -> Vec<String> {
    let re = LD_JSON_RE.get_or_init(|| {
        Regex::new(r#"(?is)<script[^>]*type\s*=\s*["']application/ld\+json["'][^>]*>(.*?)</script>"#).ok()
    });
    match re {
        Some(re) => re
            .captures_iter(html)
            .filter_map(|c| c.get(1).map(|m| m.as_str().trim().to_string()))
            .collect(),
        None => Vec::new(),
    }
}

fn is_recipe_node(v: &Value) -> bool {
    match &v["@type"] {
        Value::String(t) => t == "Recipe",
        Value::Array(ts) => ts.iter().any(|t| t.as_str() == Some("Recipe")),
        _ => false,
    }
}

/// 在 JSON-LD 中递归查找 @type=Recipe 的节点（顶层、数组、@graph）
fn find_recipe_node(v: &Value) -> Option<&Value> {
    if is_recipe_node(v) {
        return Some(v);
    }
    match v {
        Value::Array(items) => items.iter().find_map(find_recipe_node),
        Value::Object(obj) => obj.get("@graph").and_then(find_recipe_node),
        _ => None,
    }
}

fn instruction_lines(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.trim().to_string()],
        Value::Array(items) => items.iter().flat_map(instruction_lines).collect(),
        Value::Object(o) => {
            if let Some(inner) = o.get("itemListElement") {
                instruction_lines(inner)
            } else {
                o.get("text")
                    .and_then(Value::as_str)
                    .map(|s| vec![s.trim().to_string()])
                    .unwrap_or_default()
            }
        }
        _ => Vec::new(),
    }
}

/// ISO-8601 时长（PT1H30M）转分钟
fn iso_minutes(s: &str) -> Option<u32> {
    let rest = s.strip_prefix("PT")?;
    let (mut total, mut num) = (0u32, String::new());
    for c in rest.chars() {
        match c {
            '0'..='9' => num.push(c),
            'H' => {
                let hours = num.drain(..).collect::<String>().parse::<u32>().ok()?;
                total = total.checked_add(hours.checked_mul(60)?)?;
            }
            'M' => total = total.checked_add(num.drain(..).collect::<String>().parse::<u32>().ok()?)?,
            'S' => num.clear(),
            _ => return None,
        }
    }
    Some(total)
}

/// 从 HTML 的 JSON-LD 中提取菜谱；找不到时返回 None
pub fn extract_json_ld_recipe(html: &str) -> Option<Value> {
    recipe_from_ld_blocks(&ld_json_blocks(html))
}

fn recipe_from_ld_blocks(blocks: &[String]) -> Option<Value> {
    let node = blocks
        .iter()
        .filter_map(|b| serde_json::from_str::<Value>(b).ok())
        .find_map(|v| find_recipe_node(&v).cloned())?;

    let name = node["name"].as_str()?.trim().to_string();
    let ingredients: Vec<String> = node["recipeIngredient"]
        .as_array()
        .map(|a| a.iter().filter_map(Value::as_str).map(|s| s.trim().to_string()).collect())
        .unwrap_or_default();
    let instructions: Vec<String> = instruction_lines(&node["recipeInstructions"])
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();

    let mut recipe = json!({
        "name": name,
        "ingredients": ingredients,
        "instructions": instructions,
    });
    let servings = match &node["recipeYield"] {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.split_whitespace().next().and_then(|n| n.parse().ok()),
        Value::Array(a) => a.iter().find_map(|v| v.as_str()?.split_whitespace().next()?.parse().ok()),
        _ => None,
    };
    if let Some(s) = servings {
        recipe["servings"] = json!(s);
    }
    if let Some(m) = node["totalTime"].as_str().and_then(iso_minutes) {
        recipe["totalTimeMinutes"] = json!(m);
    }
    if let Some(cal) = node.pointer("/nutrition/calories").and_then(Value::as_str) {
        if let Some(n) = cal.split_whitespace().next().and_then(|n| n.parse::<f64>().ok()) {
            recipe["nutrition"] = json!({"calories": n});
        }
    }
    Some(recipe)
}

/// extract_structured_recipe：只做结构化（JSON-LD）提取，不调用模型
pub struct ExtractStructuredRecipeTool {
    schema: ToolSchema,
}

impl Default for ExtractStructuredRecipeTool {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractStructuredRecipeTool {
    pub fn new() -> Self {
        Self {
            schema: ToolSchema::new(
                "extract_structured_recipe",
                "Extract a recipe from schema.org JSON-LD embedded in page HTML",
            )
            .param(ToolParameter::optional("html", ParamType::String, "Raw page HTML"))
            .param(ToolParameter::optional(
                "jsonLd",
                ParamType::Array,
                "JSON-LD script bodies already taken from the page (the jsonLd field of fetch_page)",
            )),
        }
    }
}

#[async_trait]
impl AgentTool for ExtractStructuredRecipeTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value, _ctx: &AgentContext) -> Result<Value, AgentError> {
        let recipe = match (params["jsonLd"].as_array(), params["html"].as_str()) {
            (Some(blocks), html) => {
                let blocks: Vec<String> = blocks.iter().filter_map(Value::as_str).map(str::to_string).collect();
                recipe_from_ld_blocks(&blocks).or_else(|| html.and_then(extract_json_ld_recipe))
            }
            (None, Some(html)) => extract_json_ld_recipe(html),
            (None, None) => return Err(AgentError::InvalidArguments("Either html or jsonLd is required".to_string())),
        };
        recipe.ok_or_else(|| AgentError::ToolExecutionFailed("No structured recipe data found".to_string()))
    }
}

/// estimate_nutrition：按配料估算每份营养
pub struct EstimateNutritionTool {
    schema: ToolSchema,
    repo: Arc<dyn MealRepository>,
}

impl EstimateNutritionTool {
    pub fn new(repo: Arc<dyn MealRepository>) -> Self {
        Self {
            schema: ToolSchema::new("estimate_nutrition", "Estimate per-serving nutrition from ingredient lines")
                .param(ToolParameter::required("ingredients", ParamType::Array, "Ingredient lines"))
                .param(ToolParameter::optional("servings", ParamType::Integer, "Number of servings")),
            repo,
        }
    }
}

#[async_trait]
impl AgentTool for EstimateNutritionTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value, _ctx: &AgentContext) -> Result<Value, AgentError> {
        let ingredients: Vec<String> = params["ingredients"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
            .unwrap_or_default();
        if ingredients.is_empty() {
            return Err(AgentError::InvalidArguments("ingredients is empty".to_string()));
        }
        let servings = params["servings"].as_u64().unwrap_or(1).clamp(1, 100) as u32;
        let nutrition = self.repo.estimate_nutrition(&ingredients, servings).await?;
        serde_json::to_value(nutrition).map_err(|e| AgentError::JsonParseError(e.to_string()))
    }
}

/// search_recipes：检索用户已保存的菜谱
pub struct SearchRecipesTool {
    schema: ToolSchema,
    repo: Arc<dyn MealRepository>,
}

impl SearchRecipesTool {
    pub fn new(repo: Arc<dyn MealRepository>) -> Self {
        Self {
            schema: ToolSchema::new("search_recipes", "Search the user's saved recipes by name, cuisine or ingredient")
                .param(ToolParameter::required("query", ParamType::String, "Search text"))
                .param(ToolParameter::optional("limit", ParamType::Integer, "Maximum results (default 5)")),
            repo,
        }
    }
}

#[async_trait]
impl AgentTool for SearchRecipesTool {
    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(&self, params: Value, ctx: &AgentContext) -> Result<Value, AgentError> {
        let query = params["query"].as_str().unwrap_or_default();
        let limit = params["limit"].as_u64().unwrap_or(5).clamp(1, 50) as usize;
        let recipes = self.repo.search_recipes(&ctx.user_id, query, limit).await?;
        Ok(json!({ "recipes": recipes }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
        <script type="application/ld+json">
        {"@context": "https://schema.org", "@graph": [
            {"@type": "WebPage", "name": "Blog"},
            {"@type": ["Recipe"], "name": "Shakshuka",
             "recipeIngredient": ["4 eggs", "1 can tomatoes"],
             "recipeInstructions": [{"@type": "HowToStep", "text": "Simmer the tomatoes."},
                                    {"@type": "HowToStep", "text": "Crack in the eggs."}],
             "recipeYield": "4 servings",
             "totalTime": "PT1H5M",
             "nutrition": {"calories": "250 kcal"}}
        ]}
        </script></head><body>...</body></html>"#;

    #[test]
    fn test_extract_json_ld_from_graph() {
        let r = extract_json_ld_recipe(PAGE).unwrap();
        assert_eq!(r["name"], json!("Shakshuka"));
        assert_eq!(r["ingredients"].as_array().unwrap().len(), 2);
        assert_eq!(r["instructions"][1], json!("Crack in the eggs."));
        assert_eq!(r["servings"], json!(4));
        assert_eq!(r["totalTimeMinutes"], json!(65));
        assert_eq!(r["nutrition"]["calories"], json!(250.0));
    }

    #[test]
    fn test_extract_without_json_ld() {
        assert!(extract_json_ld_recipe("<html><body><h1>Tacos</h1></body></html>").is_none());
    }

    #[test]
    fn test_iso_minutes() {
        assert_eq!(iso_minutes("PT30M"), Some(30));
        assert_eq!(iso_minutes("PT2H"), Some(120));
        assert_eq!(iso_minutes("P1D"), None);
    }

    #[test]
    fn test_iso_minutes_overflow_is_none() {
        assert_eq!(iso_minutes("PT99999999H"), None);
        assert_eq!(iso_minutes("PT71582788H4294967295M"), None);
        // 超大时长不影响其余字段的提取
        let page = PAGE.replace("PT1H5M", "PT99999999H");
        let r = extract_json_ld_recipe(&page).unwrap();
        assert_eq!(r["name"], json!("Shakshuka"));
        assert!(r.get("totalTimeMinutes").is_none());
    }

    struct StaticFetcher;

    #[async_trait]
    impl PageFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str) -> Result<String, AgentError> {
            Ok("<html><body><h1>Tacos</h1><p>Warm the tortillas.</p></body></html>".to_string())
        }
    }

    #[tokio::test]
    async fn test_fetch_page_rejects_non_http() {
        let tool = FetchPageTool::new(Arc::new(StaticFetcher), 1000);
        let ctx = AgentContext::new("u1");
        assert!(tool.execute(json!({"url": "file:///etc/passwd"}), &ctx).await.is_err());
        let page = tool.execute(json!({"url": "https://x.test/tacos"}), &ctx).await.unwrap();
        assert!(page["text"].as_str().unwrap().contains("Tacos"));
    }

    struct LongPageFetcher;

    #[async_trait]
    impl PageFetcher for LongPageFetcher {
        async fn fetch(&self, _url: &str) -> Result<String, AgentError> {
            let filler = "<p>".to_string() + &"story ".repeat(12_000) + "</p>";
            Ok(format!("<html><body>{filler}</body>{}</html>", PAGE.trim_start_matches("<html>")))
        }
    }

    #[tokio::test]
    async fn test_fetch_page_keeps_json_ld_past_truncation() {
        let tool = FetchPageTool::new(Arc::new(LongPageFetcher), 1000);
        let ctx = AgentContext::new("u1");
        let page = tool.execute(json!({"url": "https://x.test/shakshuka"}), &ctx).await.unwrap();
        assert_eq!(page["html"].as_str().unwrap().chars().count(), 1000);
        assert!(extract_json_ld_recipe(page["html"].as_str().unwrap()).is_none());

        let extracted = ExtractStructuredRecipeTool::new()
            .execute(json!({"jsonLd": page["jsonLd"], "html": page["html"]}), &ctx)
            .await
            .unwrap();
        assert_eq!(extracted["name"], json!("Shakshuka"));
    }

    #[tokio::test]
    async fn test_extract_needs_html_or_json_ld() {
        let err = ExtractStructuredRecipeTool::new()
            .execute(json!({}), &AgentContext::new("u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidArguments(_)));
    }
}
