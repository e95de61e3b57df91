//! MealMind - 多 Agent 膳食规划助手的编排引擎
//!
//! 模块划分：
//! - **agents**: 四个领域 Agent（菜谱、计划、营养、购物）与封闭的 Agent 表
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 意图分类、路由、聚合、持久化的一轮状态机
//! - **llm**: 补全后端抽象与实现（OpenAI 兼容 / Scripted），共享补全客户端与计费
//! - **memory**: 对话日志存储与共享记忆快照
//! - **observability**: tracing 初始化
//! - **repository**: 菜谱 / 剩菜 / 饮食记录等领域数据仓库
//! - **tools**: ToolSchema、工具注册表与各 Agent 的工具

pub mod agents;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod repository;
pub mod tools;

pub use crate::core::{AgentContext, AgentResponse, Orchestrator, OrchestratorBuilder};
