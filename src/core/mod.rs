//! 核心编排层：错误、上下文与消息类型、JSON 回复解析、路由表、主控状态机与装配

pub mod builder;
pub mod context;
pub mod error;
pub mod json;
pub mod orchestrator;
pub mod routing;
pub mod types;

pub use builder::{create_backend_from_config, OrchestratorBuilder};
pub use context::{ActivePlan, AgentContext, HistoryEntry, Leftover, RecipeSummary, SharedMemory, UserPreferences};
pub use error::AgentError;
pub use json::parse_json_reply;
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use types::{
    ActionKind, AgentAction, AgentName, AgentReply, AgentResponse, Entity, EntityType, Intent, IntentClassification,
};
