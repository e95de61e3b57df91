//! 单轮上下文：AgentContext 与 SharedMemory
//!
//! SharedMemory 在每轮开始时由外部存储加载一次，整轮只读；允许轻微过期，不做轮内刷新。
//! AgentContext 以不可变引用贯穿整轮调用，被调方只返回新数据，从不修改它；唯一的例外是共享的用量累计器。

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::UsageMeter;

/// 用户偏好（饮食限制、过敏、口味等）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPreferences {
    pub dietary_restrictions: Vec<String>,
    pub allergies: Vec<String>,
    pub disliked_ingredients: Vec<String>,
    pub favorite_cuisines: Vec<String>,
    pub household_size: Option<u32>,
    pub daily_calorie_target: Option<u32>,
}

impl UserPreferences {
    pub fn is_empty(&self) -> bool {
        self.dietary_restrictions.is_empty()
            && self.allergies.is_empty()
            && self.disliked_ingredients.is_empty()
            && self.favorite_cuisines.is_empty()
            && self.household_size.is_none()
            && self.daily_calorie_target.is_none()
    }

    /// 单行摘要，用于拼进 system prompt
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.dietary_restrictions.is_empty() {
            parts.push(format!("diet: {}", self.dietary_restrictions.join(", ")));
        }
        if !self.allergies.is_empty() {
            parts.push(format!("allergies: {}", self.allergies.join(", ")));
        }
        if !self.disliked_ingredients.is_empty() {
            parts.push(format!("dislikes: {}", self.disliked_ingredients.join(", ")));
        }
        if !self.favorite_cuisines.is_empty() {
            parts.push(format!("favorite cuisines: {}", self.favorite_cuisines.join(", ")));
        }
        if let Some(n) = self.household_size {
            parts.push(format!("household of {n}"));
        }
        if let Some(kcal) = self.daily_calorie_target {
            parts.push(format!("{kcal} kcal/day target"));
        }
        parts.join("; ")
    }
}

/// 最近保存的菜谱（只含摘要字段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cuisine: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub total_time_minutes: Option<u32>,
}

/// 当前生效的膳食计划
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePlan {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

/// 剩菜 / 余量食材
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leftover {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub quantity: Option<String>,
    #[serde(default)]
    pub expires_on: Option<NaiveDate>,
    #[serde(default)]
    pub used: bool,
}

impl Leftover {
    /// 未用完且未过期
    pub fn is_active_on(&self, today: NaiveDate) -> bool {
        !self.used && self.expires_on.map_or(true, |d| d >= today)
    }
}

/// 对话历史中的一条（仅 role + content）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// 每轮加载一次的共享记忆快照
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SharedMemory {
    pub user_preferences: UserPreferences,
    pub recent_recipes: Vec<RecipeSummary>,
    pub active_plan: Option<ActivePlan>,
    pub leftovers: Vec<Leftover>,
    pub conversation_history: Vec<HistoryEntry>,
}

impl SharedMemory {
    /// 今天仍可用的剩菜
    pub fn active_leftovers(&self) -> Vec<&Leftover> {
        let today = Utc::now().date_naive();
        self.leftovers.iter().filter(|l| l.is_active_on(today)).collect()
    }
}

/// 单轮调用上下文
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub user_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub memory: SharedMemory,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// 本轮补全用量合计，由补全客户端写入
    #[serde(skip)]
    pub usage: UsageMeter,
}

impl AgentContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_memory(mut self, memory: SharedMemory) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// 换一个空的用量累计器，用于开始新的一轮
    pub fn with_fresh_usage(mut self) -> Self {
        self.usage = UsageMeter::default();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leftover_activity() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let fresh = Leftover {
            id: "l1".into(),
            name: "rice".into(),
            quantity: None,
            expires_on: NaiveDate::from_ymd_opt(2024, 5, 12),
            used: false,
        };
        let expired = Leftover {
            expires_on: NaiveDate::from_ymd_opt(2024, 5, 9),
            ..fresh.clone()
        };
        let used = Leftover {
            used: true,
            ..fresh.clone()
        };
        assert!(fresh.is_active_on(today));
        assert!(!expired.is_active_on(today));
        assert!(!used.is_active_on(today));
    }

    #[test]
    fn test_preferences_summary() {
        let prefs = UserPreferences {
            dietary_restrictions: vec!["vegetarian".into()],
            allergies: vec!["peanuts".into()],
            household_size: Some(3),
            ..Default::default()
        };
        let s = prefs.summary();
        assert!(s.contains("diet: vegetarian"));
        assert!(s.contains("allergies: peanuts"));
        assert!(s.contains("household of 3"));
        assert!(UserPreferences::default().is_empty());
    }
}
