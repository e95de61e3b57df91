//! 编排端到端场景：真实 Agent + Scripted 后端 + 内存仓库 / 存储

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use mealmind::config::AppConfig;
use mealmind::core::{ActionKind, ActivePlan, AgentError, Orchestrator, OrchestratorBuilder};
use mealmind::llm::ScriptedBackend;
use mealmind::memory::{ConversationStore, InMemoryStore, RepositoryMemoryLoader, Role};
use mealmind::repository::{InMemoryRepository, PlanItem, Recipe};
use mealmind::tools::PageFetcher;
use serde_json::json;

const SHAKSHUKA_PAGE: &str = r#"<html><head><script type="application/ld+json">
{"@context": "https://schema.org", "@graph": [
  {"@type": "WebPage", "name": "Shakshuka | Food Test"},
  {"@type": ["Recipe"], "name": "Shakshuka",
   "recipeIngredient": ["4 eggs", "1 can crushed tomatoes", "1 onion", "2 cloves garlic"],
   "recipeInstructions": [
     {"@type": "HowToStep", "text": "Soften the onion and garlic in olive oil."},
     {"@type": "HowToStep", "text": "Add the tomatoes, simmer, then poach the eggs in the sauce."}
   ],
   "recipeYield": "2", "totalTime": "PT30M",
   "nutrition": {"calories": "320 kcal"}}
]}
</script></head><body><h1>Shakshuka</h1></body></html>"#;

struct StaticFetcher(&'static str);

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, AgentError> {
        Ok(self.0.to_string())
    }
}

struct Harness {
    backend: Arc<ScriptedBackend>,
    repo: Arc<InMemoryRepository>,
    loader: Arc<RepositoryMemoryLoader>,
    store: Arc<InMemoryStore>,
    orchestrator: Orchestrator,
}

async fn harness(backend: ScriptedBackend, config: AppConfig) -> Harness {
    let backend = Arc::new(backend);
    let repo = Arc::new(InMemoryRepository::new());
    let loader = Arc::new(RepositoryMemoryLoader::new(repo.clone()));
    let store = Arc::new(InMemoryStore::new());
    let orchestrator = OrchestratorBuilder::new(config)
        .with_backend(backend.clone())
        .with_repository(repo.clone())
        .with_fetcher(Arc::new(StaticFetcher(SHAKSHUKA_PAGE)))
        .with_store(store.clone())
        .with_memory_loader(loader.clone())
        .build()
        .await
        .unwrap();
    Harness {
        backend,
        repo,
        loader,
        store,
        orchestrator,
    }
}

fn classified(intent: &str, entities: serde_json::Value) -> String {
    json!({"primaryIntent": intent, "secondaryIntents": [], "confidence": 0.92, "entities": entities}).to_string()
}

#[tokio::test]
async fn recipe_url_import_produces_save_action_and_persists_turn() {
    let h = harness(
        ScriptedBackend::new().reply(classified(
            "parse_recipe",
            json!([{"type": "url", "value": "https://food.test/shakshuka"}]),
        )),
        AppConfig::default(),
    )
    .await;

    let ctx = h.orchestrator.build_context("u1", None).await.unwrap();
    let r = h
        .orchestrator
        .process("Save this recipe https://food.test/shakshuka", &ctx)
        .await;

    assert!(r.success, "{}", r.message);
    assert_eq!(r.actions.len(), 1);
    assert_eq!(r.actions[0].kind, ActionKind::SaveRecipe);
    let recipe = &r.actions[0].payload["recipe"];
    assert_eq!(recipe["name"], json!("Shakshuka"));
    assert_eq!(recipe["sourceUrl"], json!("https://food.test/shakshuka"));
    assert_eq!(recipe["importedVia"], json!("structured_data"));

    let data = r.data.unwrap();
    let meta = &data["_meta"];
    assert_eq!(meta["intent"], json!("parse_recipe"));
    assert_eq!(meta["agents"], json!(["recipe"]));
    // 只有分类一次补全
    assert_eq!(h.backend.request_count(), 1);
    assert_eq!(meta["tokenUsage"]["inputTokens"], json!(10));

    let id = meta["conversationId"].as_str().unwrap();
    let log = h.store.load_recent_messages(id, 10).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].role, Role::User);
    assert_eq!(log[1].role, Role::Orchestrator);
    assert_eq!(log[1].tool_results.as_ref().unwrap()["agents"], json!(["recipe"]));
}

#[tokio::test]
async fn planning_without_recipes_chains_into_recipe_starters() {
    let h = harness(
        ScriptedBackend::new().reply(classified("plan_meals", json!([]))),
        AppConfig::default(),
    )
    .await;

    let ctx = h.orchestrator.build_context("u1", None).await.unwrap();
    let r = h.orchestrator.process("Plan my dinners for this week", &ctx).await;

    let data = r.data.unwrap();
    assert_eq!(data["_meta"]["agents"], json!(["planning", "recipe"]));
    // 聚合回复不可解析，退回拼接并按 Agent 名合并 data
    assert_eq!(data["planning"]["reason"], json!("no_recipes"));
    assert_eq!(data["recipe"]["suggestions"].as_array().unwrap().len(), 3);
    assert_eq!(data["recipe"]["requestedBy"], json!("planning"));
    assert!(r.message.contains("saved recipes"));
    assert!(!r.success);
}

#[tokio::test]
async fn shopping_without_plan_chains_into_planning() {
    let h = harness(
        ScriptedBackend::new().reply(classified("generate_shopping_list", json!([]))),
        AppConfig::default(),
    )
    .await;
    h.repo
        .add_recipe("u1", Recipe::new("r1", "Tacos").with_ingredients(&["8 tortillas", "1 lb ground beef"]))
        .await;
    h.repo
        .add_recipe("u1", Recipe::new("r2", "Dal").with_ingredients(&["1 cup lentils", "1 onion"]))
        .await;

    let ctx = h.orchestrator.build_context("u1", None).await.unwrap();
    let r = h.orchestrator.process("make me a grocery list", &ctx).await;

    let data = r.data.unwrap();
    assert_eq!(data["_meta"]["agents"], json!(["shopping", "planning"]));
    assert!(r.actions.iter().any(|a| a.kind == ActionKind::SaveMealPlan));
    assert_eq!(data["shopping"]["reason"], json!("no_active_plan"));
}

#[tokio::test]
async fn shopping_list_from_active_plan_skips_leftovers() {
    let h = harness(
        ScriptedBackend::new().reply(classified("generate_shopping_list", json!([]))),
        AppConfig::default(),
    )
    .await;
    h.repo
        .add_recipe(
            "u1",
            Recipe::new("r1", "Fried Rice").with_ingredients(&["2 cups rice", "2 eggs", "1 cup peas"]),
        )
        .await;
    let day = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
    h.repo
        .set_plan(
            "u1",
            "p1",
            vec![PlanItem {
                date: day,
                meal_type: "dinner".into(),
                recipe_id: "r1".into(),
                recipe_name: "Fried Rice".into(),
            }],
        )
        .await;
    h.repo
        .add_leftover(
            "u1",
            mealmind::core::Leftover {
                id: "l1".into(),
                name: "rice".into(),
                quantity: Some("1 container".into()),
                expires_on: None,
                used: false,
            },
        )
        .await;
    h.loader
        .set_active_plan(
            "u1",
            Some(ActivePlan {
                id: "p1".into(),
                name: Some("Week 23".into()),
                start_date: Some(day),
                end_date: None,
            }),
        )
        .await;

    let ctx = h.orchestrator.build_context("u1", None).await.unwrap();
    let r = h.orchestrator.process("what do I need to buy?", &ctx).await;

    assert!(r.success, "{}", r.message);
    assert_eq!(r.actions[0].kind, ActionKind::SaveShoppingList);
    let data = r.data.unwrap();
    assert_eq!(data["planId"], json!("p1"));
    assert_eq!(data["itemCount"], json!(2));
    assert_eq!(data["coveredByLeftovers"], json!(["2 cups rice"]));
}

#[tokio::test]
async fn hung_backend_times_out_with_generic_error() {
    let mut config = AppConfig::default();
    config.llm.timeouts.request = 1;
    let h = harness(ScriptedBackend::new().hang(), config).await;

    let ctx = h.orchestrator.build_context("u1", None).await.unwrap();
    let r = h.orchestrator.process("plan my week", &ctx).await;

    assert!(!r.success);
    assert_eq!(r.error.as_deref(), Some("AI service temporarily unavailable"));
    assert!(r.message.ends_with("Please try again."));
    assert_eq!(h.store.conversation_count().await, 1);
}

#[tokio::test]
async fn usage_of_agent_that_fails_midway_is_reported() {
    let h = harness(
        ScriptedBackend::new()
            .reply(classified("parse_recipe", json!([])))
            .tool_call("search_recipes", json!({"query": "spicy"}))
            .fail_status(500, "boom"),
        AppConfig::default(),
    )
    .await;

    let ctx = h.orchestrator.build_context("u1", None).await.unwrap();
    let r = h.orchestrator.process("what spicy dish have I cooked before?", &ctx).await;

    assert!(!r.success);
    assert_eq!(r.error.as_deref(), Some("AI service temporarily unavailable"));
    let data = r.data.unwrap();
    // 分类 + Recipe 的工具调用补全；失败的第三次不计
    assert_eq!(data["_meta"]["tokenUsage"]["inputTokens"], json!(20));
    assert_eq!(data["_meta"]["tokenUsage"]["outputTokens"], json!(10));

    let id = data["_meta"]["conversationId"].as_str().unwrap();
    let log = h.store.load_recent_messages(id, 10).await.unwrap();
    assert_eq!(log[1].token_usage.as_ref().unwrap().input_tokens, 20);
}
