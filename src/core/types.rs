//! 共享数据契约：意图、实体、Agent 标识与响应
//!
//! 所有对外结构都可 JSON 序列化，字段名为 camelCase，与前端约定的响应形状一致。

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::TokenUsage;

/// 意图（封闭集合）；模型返回集合外的值时反序列化为 Unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    ParseRecipe,
    SaveRecipe,
    PlanMeals,
    SuggestMeal,
    AnalyzeNutrition,
    GenerateShoppingList,
    CheckLeftovers,
    GetSubstitution,
    GeneralQuestion,
    #[serde(other)]
    Unknown,
}

impl Intent {
    pub const ALL: [Intent; 10] = [
        Intent::ParseRecipe,
        Intent::SaveRecipe,
        Intent::PlanMeals,
        Intent::SuggestMeal,
        Intent::AnalyzeNutrition,
        Intent::GenerateShoppingList,
        Intent::CheckLeftovers,
        Intent::GetSubstitution,
        Intent::GeneralQuestion,
        Intent::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::ParseRecipe => "parse_recipe",
            Intent::SaveRecipe => "save_recipe",
            Intent::PlanMeals => "plan_meals",
            Intent::SuggestMeal => "suggest_meal",
            Intent::AnalyzeNutrition => "analyze_nutrition",
            Intent::GenerateShoppingList => "generate_shopping_list",
            Intent::CheckLeftovers => "check_leftovers",
            Intent::GetSubstitution => "get_substitution",
            Intent::GeneralQuestion => "general_question",
            Intent::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 实体类型（封闭集合）；集合外的值归为 Other，随后被丢弃
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Url,
    RecipeName,
    Ingredient,
    Date,
    MealType,
    Cuisine,
    Dietary,
    #[serde(other)]
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Url => "url",
            EntityType::RecipeName => "recipe_name",
            EntityType::Ingredient => "ingredient",
            EntityType::Date => "date",
            EntityType::MealType => "meal_type",
            EntityType::Cuisine => "cuisine",
            EntityType::Dietary => "dietary",
            EntityType::Other => "other",
        }
    }
}

/// 从用户消息中抽取的实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub value: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

impl Entity {
    pub fn new(entity_type: EntityType, value: impl Into<String>) -> Self {
        Self {
            entity_type,
            value: value.into(),
            confidence: 1.0,
        }
    }
}

/// 意图分类结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntentClassification {
    pub primary_intent: Intent,
    #[serde(default)]
    pub secondary_intents: Vec<Intent>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl IntentClassification {
    /// 分类失败时的降级结果
    pub fn unknown() -> Self {
        Self {
            primary_intent: Intent::Unknown,
            secondary_intents: Vec::new(),
            confidence: 0.0,
            entities: Vec::new(),
        }
    }

    /// 规整模型输出：置信度截到 [0,1]，去掉与主意图重复或重复出现的次意图，丢弃未知类型实体
    pub fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let primary = self.primary_intent;
        let mut seen = vec![primary];
        self.secondary_intents.retain(|i| {
            if seen.contains(i) {
                false
            } else {
                seen.push(*i);
                true
            }
        });
        self.entities.retain(|e| e.entity_type != EntityType::Other);
        for e in &mut self.entities {
            if !e.confidence.is_finite() {
                e.confidence = 0.0;
            }
            e.confidence = e.confidence.clamp(0.0, 1.0);
        }
        self
    }
}

/// 领域 Agent 标识（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    Recipe,
    Planning,
    Nutrition,
    Shopping,
}

impl AgentName {
    pub const ALL: [AgentName; 4] = [
        AgentName::Recipe,
        AgentName::Planning,
        AgentName::Nutrition,
        AgentName::Shopping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentName::Recipe => "recipe",
            AgentName::Planning => "planning",
            AgentName::Nutrition => "nutrition",
            AgentName::Shopping => "shopping",
        }
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 需要调用方（核心之外）落地的副作用类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    SaveRecipe,
    SaveMealPlan,
    SaveShoppingList,
}

/// 副作用描述：本核心只描述，从不自行执行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub payload: Value,
}

impl AgentAction {
    pub fn new(kind: ActionKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}

/// Agent / 编排器的统一响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<AgentAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_agent: Option<AgentName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            actions: Vec::new(),
            next_agent: None,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok(message)
        }
    }

    /// 数据不足时请求由另一个 Agent 接手本轮
    pub fn redirect(message: impl Into<String>, next: AgentName) -> Self {
        Self {
            success: false,
            next_agent: Some(next),
            ..Self::ok(message)
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_action(mut self, action: AgentAction) -> Self {
        self.actions.push(action);
        self
    }
}

/// Agent 处理结果：响应本身 + 该 Agent 内部所有补全调用的用量合计
#[derive(Debug, Clone)]
pub struct AgentReply {
    pub response: AgentResponse,
    pub usage: Option<TokenUsage>,
}

impl AgentReply {
    pub fn new(response: AgentResponse, usage: Option<TokenUsage>) -> Self {
        Self { response, usage }
    }
}

impl From<AgentResponse> for AgentReply {
    fn from(response: AgentResponse) -> Self {
        Self {
            response,
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_intent_out_of_set_is_unknown() {
        let i: Intent = serde_json::from_value(json!("order_pizza")).unwrap();
        assert_eq!(i, Intent::Unknown);
        let i: Intent = serde_json::from_value(json!("plan_meals")).unwrap();
        assert_eq!(i, Intent::PlanMeals);
    }

    #[test]
    fn test_intent_as_str_matches_serde() {
        for intent in Intent::ALL {
            assert_eq!(serde_json::to_value(intent).unwrap(), json!(intent.as_str()));
        }
    }

    #[test]
    fn test_normalized_dedups_and_clamps() {
        let c = IntentClassification {
            primary_intent: Intent::SuggestMeal,
            secondary_intents: vec![Intent::SuggestMeal, Intent::PlanMeals, Intent::PlanMeals],
            confidence: 1.7,
            entities: vec![
                Entity::new(EntityType::Other, "x"),
                Entity::new(EntityType::Dietary, "vegan"),
            ],
        }
        .normalized();
        assert_eq!(c.secondary_intents, vec![Intent::PlanMeals]);
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.entities.len(), 1);
    }

    #[test]
    fn test_response_shape() {
        let r = AgentResponse::redirect("No recipes yet", AgentName::Recipe);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["success"], json!(false));
        assert_eq!(v["nextAgent"], json!("recipe"));
        assert!(v.get("actions").is_none());
        assert!(v.get("data").is_none());

        let r = AgentResponse::ok("saved").with_action(AgentAction::new(
            ActionKind::SaveRecipe,
            json!({"recipe": {"name": "Tacos"}}),
        ));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["actions"][0]["type"], json!("save_recipe"));
    }
}
