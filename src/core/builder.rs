//! 编排器构建器：由 AppConfig 统一装配后端、仓库、存储与四个 Agent
//!
//! CLI 与测试共用同一套装配逻辑；测试可用 with_* 注入替身。

use std::sync::Arc;
use std::time::Duration;

use crate::agents::{AgentDeps, AgentSet};
use crate::config::{AppConfig, StoreBackend};
use crate::core::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::core::AgentError;
use crate::llm::{CompletionBackend, CompletionClient, OpenAiBackend, ScriptedBackend};
use crate::memory::{ConversationStore, InMemoryStore, MemoryLoader, RepositoryMemoryLoader};
use crate::repository::{InMemoryRepository, MealRepository};
use crate::tools::{HttpPageFetcher, PageFetcher};

/// 按配置选择补全后端：provider 为 openai 且能读到 API Key 时走 OpenAI 兼容端点，否则退回 Scripted
pub fn create_backend_from_config(cfg: &AppConfig) -> Arc<dyn CompletionBackend> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var(&cfg.llm.api_key_env).ok().filter(|k| !k.trim().is_empty());

    match (provider.as_str(), api_key) {
        ("openai", Some(key)) => {
            tracing::info!(model = %cfg.llm.model, base_url = ?cfg.llm.base_url, "Using OpenAI-compatible backend");
            Arc::new(OpenAiBackend::new(cfg.llm.base_url.as_deref(), Some(&key)))
        }
        ("mock", _) => {
            tracing::info!("Using scripted offline backend");
            Arc::new(ScriptedBackend::new())
        }
        _ => {
            tracing::warn!(
                provider = %provider,
                key_env = %cfg.llm.api_key_env,
                "No API key set or provider unknown, using offline backend"
            );
            Arc::new(ScriptedBackend::new())
        }
    }
}

pub struct OrchestratorBuilder {
    config: AppConfig,
    backend: Option<Arc<dyn CompletionBackend>>,
    repo: Option<Arc<dyn MealRepository>>,
    fetcher: Option<Arc<dyn PageFetcher>>,
    store: Option<Arc<dyn ConversationStore>>,
    memory: Option<Arc<dyn MemoryLoader>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            backend: None,
            repo: None,
            fetcher: None,
            store: None,
            memory: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_repository(mut self, repo: Arc<dyn MealRepository>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 未设置时用基于仓库的快照加载器
    pub fn with_memory_loader(mut self, memory: Arc<dyn MemoryLoader>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub async fn build(self) -> Result<Orchestrator, AgentError> {
        let cfg = &self.config;
        let backend = self.backend.unwrap_or_else(|| create_backend_from_config(cfg));
        let client = Arc::new(
            CompletionClient::new(backend, cfg.llm.model.clone())
                .with_timeout(Duration::from_secs(cfg.llm.timeouts.request))
                .with_max_tokens(cfg.llm.max_tokens),
        );

        let repo = self.repo.unwrap_or_else(|| Arc::new(InMemoryRepository::new()));
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpPageFetcher::new(cfg.tools.fetch.timeout_secs)));
        let deps = AgentDeps::new(client.clone(), repo.clone())
            .with_tool_timeout(Duration::from_secs(cfg.tools.tool_timeout_secs));
        let agents = AgentSet::standard(&deps, fetcher, cfg.tools.fetch.max_page_chars);

        let store = match self.store {
            Some(store) => store,
            None => open_store(cfg).await?,
        };
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(RepositoryMemoryLoader::new(repo)));

        let settings = OrchestratorSettings {
            history_limit: cfg.app.history_limit,
            max_chain_depth: cfg.app.max_chain_depth,
        };
        Ok(Orchestrator::new(client, agents, store, memory).with_settings(settings))
    }
}

async fn open_store(cfg: &AppConfig) -> Result<Arc<dyn ConversationStore>, AgentError> {
    match cfg.store.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        #[cfg(feature = "sqlite")]
        StoreBackend::Sqlite => {
            if let Some(parent) = cfg.store.sqlite_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| AgentError::ConfigError(e.to_string()))?;
            }
            let store = crate::memory::SqliteConversationStore::open(&cfg.store.sqlite_path).await?;
            tracing::info!(path = %cfg.store.sqlite_path.display(), "Using SQLite conversation store");
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StoreBackend::Sqlite => {
            tracing::warn!("store.backend = sqlite but the sqlite feature is disabled, using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_builds_with_injected_backend() {
        let backend = Arc::new(ScriptedBackend::new().reply(
            json!({"primaryIntent": "general_question", "confidence": 0.9}).to_string(),
        ).reply("Salt the pasta water generously."));
        let orchestrator = OrchestratorBuilder::new(AppConfig::default())
            .with_backend(backend)
            .build()
            .await
            .unwrap();
        let ctx = orchestrator.build_context("u1", None).await.unwrap();
        let r = orchestrator.process("how salty should pasta water be?", &ctx).await;
        assert!(r.success);
        assert_eq!(r.message, "Salt the pasta water generously.");
    }

    #[test]
    fn test_mock_provider_selects_offline_backend() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        assert_eq!(create_backend_from_config(&cfg).name(), "scripted");
    }
}
