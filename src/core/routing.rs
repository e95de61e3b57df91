//! 路由表与消息增强
//!
//! - 意图 → Agent 列表的静态表；主意图在前、次意图在后，按首次出现去重
//! - 每个 Agent 的实体类型白名单；相关实体以固定格式的尾注追加到发给该 Agent 的消息
//! - Agent 侧用 `split_enriched` 把尾注拆回 (原文, 实体)

use crate::core::{AgentName, Entity, EntityType, Intent, IntentClassification};

const TRAILER_HEADER: &str = "[Extracted entities]";

/// 意图对应的 Agent（按调用顺序）
pub fn agents_for_intent(intent: Intent) -> &'static [AgentName] {
    match intent {
        Intent::ParseRecipe | Intent::SaveRecipe => &[AgentName::Recipe],
        Intent::PlanMeals | Intent::CheckLeftovers => &[AgentName::Planning],
        Intent::SuggestMeal => &[AgentName::Planning, AgentName::Nutrition],
        Intent::AnalyzeNutrition => &[AgentName::Nutrition],
        Intent::GenerateShoppingList => &[AgentName::Shopping],
        Intent::GetSubstitution => &[AgentName::Recipe, AgentName::Nutrition],
        Intent::GeneralQuestion | Intent::Unknown => &[],
    }
}

/// 本轮要调用的 Agent：主意图的 Agent 在前，再依次追加各次意图的；同一 Agent 只出现一次
pub fn plan_agents(classification: &IntentClassification) -> Vec<AgentName> {
    let mut agents = Vec::new();
    let intents = std::iter::once(&classification.primary_intent).chain(&classification.secondary_intents);
    for intent in intents {
        for agent in agents_for_intent(*intent) {
            if !agents.contains(agent) {
                agents.push(*agent);
            }
        }
    }
    agents
}

/// Agent 关心的实体类型
pub fn relevant_entity_types(agent: AgentName) -> &'static [EntityType] {
    match agent {
        AgentName::Recipe => &[
            EntityType::Url,
            EntityType::RecipeName,
            EntityType::Ingredient,
            EntityType::Cuisine,
        ],
        AgentName::Planning => &[
            EntityType::Date,
            EntityType::MealType,
            EntityType::Cuisine,
            EntityType::Dietary,
            EntityType::RecipeName,
        ],
        AgentName::Nutrition => &[EntityType::Ingredient, EntityType::RecipeName, EntityType::Dietary],
        AgentName::Shopping => &[EntityType::Date, EntityType::Ingredient, EntityType::RecipeName],
    }
}

/// 为指定 Agent 增强消息；没有相关实体时原样返回
pub fn enrich_message(message: &str, agent: AgentName, entities: &[Entity]) -> String {
    let allowed = relevant_entity_types(agent);
    let lines: Vec<String> = entities
        .iter()
        .filter(|e| allowed.contains(&e.entity_type) && !e.value.trim().is_empty())
        .map(|e| format!("- {}: {}", e.entity_type.as_str(), e.value.trim()))
        .collect();
    if lines.is_empty() {
        return message.to_string();
    }
    format!("{message}\n\n{TRAILER_HEADER}\n{}", lines.join("\n"))
}

/// 拆分增强后的消息：返回原始文本与尾注中的实体
pub fn split_enriched(message: &str) -> (&str, Vec<Entity>) {
    let Some(pos) = message.rfind(TRAILER_HEADER) else {
        return (message, Vec::new());
    };
    let entities = message[pos + TRAILER_HEADER.len()..]
        .lines()
        .filter_map(|line| {
            let (kind, value) = line.trim().strip_prefix("- ")?.split_once(':')?;
            let entity_type: EntityType = serde_json::from_value(serde_json::Value::String(kind.trim().to_string())).ok()?;
            (entity_type != EntityType::Other).then(|| Entity::new(entity_type, value.trim()))
        })
        .collect();
    (message[..pos].trim_end(), entities)
}

/// 取第一个指定类型实体的值
pub fn first_entity(entities: &[Entity], kind: EntityType) -> Option<&str> {
    entities.iter().find(|e| e.entity_type == kind).map(|e| e.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classification(primary: Intent, secondary: &[Intent]) -> IntentClassification {
        IntentClassification {
            primary_intent: primary,
            secondary_intents: secondary.to_vec(),
            confidence: 0.9,
            entities: vec![],
        }
    }

    #[test]
    fn test_dedup_keeps_first_occurrence_order() {
        let c = classification(Intent::SuggestMeal, &[Intent::PlanMeals, Intent::GenerateShoppingList]);
        assert_eq!(
            plan_agents(&c),
            vec![AgentName::Planning, AgentName::Nutrition, AgentName::Shopping]
        );
    }

    #[test]
    fn test_general_question_has_no_agents() {
        assert!(plan_agents(&classification(Intent::GeneralQuestion, &[])).is_empty());
        assert!(plan_agents(&IntentClassification::unknown()).is_empty());
    }

    #[test]
    fn test_dietary_entity_goes_to_nutrition_only() {
        let entities = vec![
            Entity::new(EntityType::Dietary, "vegan"),
            Entity::new(EntityType::Ingredient, "tofu"),
        ];
        let to_nutrition = enrich_message("is this ok?", AgentName::Nutrition, &entities);
        let to_recipe = enrich_message("is this ok?", AgentName::Recipe, &entities);
        assert!(to_nutrition.contains("- dietary: vegan"));
        assert!(!to_recipe.contains("vegan"));
        assert!(to_recipe.contains("- ingredient: tofu"));
    }

    #[test]
    fn test_no_relevant_entities_leaves_message_untouched() {
        let entities = vec![Entity::new(EntityType::Url, "https://a.test/r")];
        assert_eq!(enrich_message("plan my week", AgentName::Planning, &entities), "plan my week");
    }

    #[test]
    fn test_split_enriched_roundtrip() {
        let entities = vec![
            Entity::new(EntityType::RecipeName, "Chili: Texas style"),
            Entity::new(EntityType::Dietary, "vegan"),
        ];
        let enriched = enrich_message("how healthy is it", AgentName::Nutrition, &entities);
        let (text, parsed) = split_enriched(&enriched);
        assert_eq!(text, "how healthy is it");
        assert_eq!(first_entity(&parsed, EntityType::RecipeName), Some("Chili: Texas style"));
        assert_eq!(parsed.len(), 2);
        assert_eq!(split_enriched("plain").0, "plain");
    }
}
