//! 共享记忆快照加载：偏好与当前计划来自用户档案，最近菜谱与剩菜来自领域仓库

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::core::{ActivePlan, AgentError, RecipeSummary, SharedMemory, UserPreferences};
use crate::memory::MemoryLoader;
use crate::repository::MealRepository;

/// 快照中最多带入的最近菜谱数
const SNAPSHOT_RECIPES: usize = 10;

#[derive(Debug, Clone, Default)]
struct UserProfile {
    preferences: UserPreferences,
    active_plan: Option<ActivePlan>,
}

pub struct RepositoryMemoryLoader {
    repo: Arc<dyn MealRepository>,
    profiles: RwLock<HashMap<String, UserProfile>>,
}

impl RepositoryMemoryLoader {
    pub fn new(repo: Arc<dyn MealRepository>) -> Self {
        Self {
            repo,
            profiles: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_preferences(&self, user_id: &str, preferences: UserPreferences) {
        self.profiles.write().await.entry(user_id.to_string()).or_default().preferences = preferences;
    }

    pub async fn set_active_plan(&self, user_id: &str, plan: Option<ActivePlan>) {
        self.profiles.write().await.entry(user_id.to_string()).or_default().active_plan = plan;
    }
}

#[async_trait]
impl MemoryLoader for RepositoryMemoryLoader {
    async fn load_shared_memory(&self, user_id: &str) -> Result<SharedMemory, AgentError> {
        let profile = self.profiles.read().await.get(user_id).cloned().unwrap_or_default();
        let recent_recipes = self
            .repo
            .recent_recipes(user_id, SNAPSHOT_RECIPES)
            .await?
            .into_iter()
            .map(|r| RecipeSummary {
                id: r.id,
                name: r.name,
                cuisine: r.cuisine,
                tags: r.tags,
                total_time_minutes: r.total_time_minutes,
            })
            .collect();
        let today = Utc::now().date_naive();
        let leftovers = self
            .repo
            .leftovers(user_id)
            .await?
            .into_iter()
            .filter(|l| l.is_active_on(today))
            .collect();
        Ok(SharedMemory {
            user_preferences: profile.preferences,
            recent_recipes,
            active_plan: profile.active_plan,
            leftovers,
            conversation_history: Vec::new(),
        })
    }
}
