//! 领域数据仓库（对编排核心不透明）
//!
//! 菜谱 / 剩菜 / 用餐历史 / 计划条目的查询契约；只经由各 Agent 自己的工具调用。
//! InMemoryRepository 供离线运行与测试使用。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::{AgentError, Leftover};

/// 每份营养数据
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Nutrition {
    pub calories: f64,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
}

impl Nutrition {
    pub fn add(&self, other: &Nutrition) -> Nutrition {
        Nutrition {
            calories: self.calories + other.calories,
            protein_g: self.protein_g + other.protein_g,
            carbs_g: self.carbs_g + other.carbs_g,
            fat_g: self.fat_g + other.fat_g,
        }
    }
}

/// 已保存的菜谱
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub ingredients: Vec<String>,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub servings: Option<u32>,
    #[serde(default)]
    pub cuisine: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub total_time_minutes: Option<u32>,
    #[serde(default)]
    pub nutrition: Option<Nutrition>,
    #[serde(default)]
    pub source_url: Option<String>,
}

impl Recipe {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ingredients: Vec::new(),
            instructions: Vec::new(),
            servings: None,
            cuisine: None,
            tags: Vec::new(),
            total_time_minutes: None,
            nutrition: None,
            source_url: None,
        }
    }

    pub fn with_ingredients(mut self, items: &[&str]) -> Self {
        self.ingredients = items.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_nutrition(mut self, nutrition: Nutrition) -> Self {
        self.nutrition = Some(nutrition);
        self
    }

    pub fn with_cuisine(mut self, cuisine: &str) -> Self {
        self.cuisine = Some(cuisine.to_string());
        self
    }
}

/// 一条用餐记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealRecord {
    pub date: NaiveDate,
    pub meal_type: String,
    #[serde(default)]
    pub recipe_id: Option<String>,
    pub recipe_name: String,
    #[serde(default)]
    pub nutrition: Option<Nutrition>,
}

/// 计划中的一餐
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    pub date: NaiveDate,
    pub meal_type: String,
    pub recipe_id: String,
    pub recipe_name: String,
}

/// 仓库契约
#[async_trait]
pub trait MealRepository: Send + Sync {
    async fn search_recipes(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<Recipe>, AgentError>;

    async fn recent_recipes(&self, user_id: &str, limit: usize) -> Result<Vec<Recipe>, AgentError>;

    /// 按 id 或（不区分大小写的）名称取单个菜谱
    async fn get_recipe(&self, user_id: &str, id_or_name: &str) -> Result<Option<Recipe>, AgentError>;

    async fn leftovers(&self, user_id: &str) -> Result<Vec<Leftover>, AgentError>;

    /// 最近 days 天的用餐记录
    async fn meal_history(&self, user_id: &str, days: u32) -> Result<Vec<MealRecord>, AgentError>;

    async fn plan_items(&self, user_id: &str, plan_id: &str) -> Result<Vec<PlanItem>, AgentError>;

    /// 按配料行估算每份营养
    async fn estimate_nutrition(&self, ingredients: &[String], servings: u32) -> Result<Nutrition, AgentError>;
}

#[derive(Debug, Default)]
struct UserData {
    recipes: Vec<Recipe>,
    leftovers: Vec<Leftover>,
    history: Vec<MealRecord>,
    plans: HashMap<String, Vec<PlanItem>>,
}

/// 内存仓库：按用户分区；recipes 以插入顺序为「最近」的倒序
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    users: RwLock<HashMap<String, UserData>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_recipe(&self, user_id: &str, recipe: Recipe) {
        self.users.write().await.entry(user_id.to_string()).or_default().recipes.push(recipe);
    }

    pub async fn add_leftover(&self, user_id: &str, leftover: Leftover) {
        self.users.write().await.entry(user_id.to_string()).or_default().leftovers.push(leftover);
    }

    pub async fn add_meal(&self, user_id: &str, meal: MealRecord) {
        self.users.write().await.entry(user_id.to_string()).or_default().history.push(meal);
    }

    pub async fn set_plan(&self, user_id: &str, plan_id: &str, items: Vec<PlanItem>) {
        self.users
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .plans
            .insert(plan_id.to_string(), items);
    }
}

#[async_trait]
impl MealRepository for InMemoryRepository {
    async fn search_recipes(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<Recipe>, AgentError> {
        let q = query.to_lowercase();
        let terms: Vec<&str> = q.split_whitespace().collect();
        let users = self.users.read().await;
        let Some(data) = users.get(user_id) else {
            return Ok(Vec::new());
        };
        Ok(data
            .recipes
            .iter()
            .rev()
            .filter(|r| {
                let hay = format!(
                    "{} {} {} {}",
                    r.name,
                    r.cuisine.as_deref().unwrap_or_default(),
                    r.tags.join(" "),
                    r.ingredients.join(" ")
                )
                .to_lowercase();
                terms.is_empty() || terms.iter().any(|t| hay.contains(t))
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent_recipes(&self, user_id: &str, limit: usize) -> Result<Vec<Recipe>, AgentError> {
        let users = self.users.read().await;
        Ok(users
            .get(user_id)
            .map(|d| d.recipes.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_recipe(&self, user_id: &str, id_or_name: &str) -> Result<Option<Recipe>, AgentError> {
        let key = id_or_name.trim().to_lowercase();
        let users = self.users.read().await;
        Ok(users.get(user_id).and_then(|d| {
            d.recipes
                .iter()
                .find(|r| r.id == id_or_name || r.name.to_lowercase() == key)
                .cloned()
        }))
    }

    async fn leftovers(&self, user_id: &str) -> Result<Vec<Leftover>, AgentError> {
        let users = self.users.read().await;
        Ok(users.get(user_id).map(|d| d.leftovers.clone()).unwrap_or_default())
    }

    async fn meal_history(&self, user_id: &str, days: u32) -> Result<Vec<MealRecord>, AgentError> {
        let cutoff = Utc::now().date_naive() - ChronoDuration::days(i64::from(days));
        let users = self.users.read().await;
        Ok(users
            .get(user_id)
            .map(|d| d.history.iter().filter(|m| m.date >= cutoff).cloned().collect())
            .unwrap_or_default())
    }

    async fn plan_items(&self, user_id: &str, plan_id: &str) -> Result<Vec<PlanItem>, AgentError> {
        let users = self.users.read().await;
        Ok(users
            .get(user_id)
            .and_then(|d| d.plans.get(plan_id).cloned())
            .unwrap_or_default())
    }

    async fn estimate_nutrition(&self, ingredients: &[String], servings: u32) -> Result<Nutrition, AgentError> {
        // 粗略估算：每行配料按固定份额计
        let lines = ingredients.iter().filter(|l| !l.trim().is_empty()).count() as f64;
        let servings = f64::from(servings.max(1));
        Ok(Nutrition {
            calories: (lines * 120.0 / servings).round(),
            protein_g: (lines * 5.0 / servings).round(),
            carbs_g: (lines * 12.0 / servings).round(),
            fat_g: (lines * 5.0 / servings).round(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recent_and_search() {
        let repo = InMemoryRepository::new();
        repo.add_recipe("u1", Recipe::new("r1", "Tacos").with_cuisine("mexican")).await;
        repo.add_recipe("u1", Recipe::new("r2", "Miso Soup").with_ingredients(&["miso", "tofu"])).await;

        let recent = repo.recent_recipes("u1", 1).await.unwrap();
        assert_eq!(recent[0].id, "r2");
        let found = repo.search_recipes("u1", "tofu", 5).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Miso Soup");
        assert!(repo.search_recipes("u2", "tofu", 5).await.unwrap().is_empty());
        assert_eq!(repo.get_recipe("u1", "tacos").await.unwrap().unwrap().id, "r1");
    }

    #[tokio::test]
    async fn test_estimate_nutrition_scales_by_servings() {
        let repo = InMemoryRepository::new();
        let lines = vec!["1 cup rice".to_string(), "2 eggs".to_string()];
        let one = repo.estimate_nutrition(&lines, 1).await.unwrap();
        let two = repo.estimate_nutrition(&lines, 2).await.unwrap();
        assert!(one.calories > two.calories);
        assert_eq!(two.calories, 120.0);
    }
}
