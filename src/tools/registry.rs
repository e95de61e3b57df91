//! 工具注册表与执行垫片
//!
//! 每个 Agent 持有自己的 ToolRegistry（工具不跨 Agent 共享引用）。所有工具实现 AgentTool
//! （schema / execute），execute 统一返回 ToolResult：未知工具、参数不合法、工具内部错误、
//! panic 与超时都在这里被捕获并转为 {success:false, error}，绝不向外抛出。
//! 每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use crate::core::{AgentContext, AgentError};
use crate::tools::ToolSchema;

/// 工具执行的统一结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// 成功时的数据；失败或无数据时为 None
    pub fn into_data(self) -> Option<Value> {
        if self.success {
            self.data
        } else {
            None
        }
    }
}

/// 工具 trait：schema（名称 / 描述 / 参数）与异步执行
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn schema(&self) -> &ToolSchema;

    fn name(&self) -> &str {
        &self.schema().name
    }

    /// 执行工具；Err 会在注册表边界转为 ToolResult
    async fn execute(&self, params: Value, ctx: &AgentContext) -> Result<Value, AgentError>;
}

/// 工具注册表：按名称存储 Arc<dyn AgentTool>，对每次调用施加超时
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
    timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register(&mut self, tool: impl AgentTool + 'static) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 按名称取 schema（用于向补全 API 声明工具）；未注册的名称被忽略
    pub fn schemas_for(&self, names: &[&str]) -> Vec<ToolSchema> {
        names
            .iter()
            .filter_map(|n| self.tools.get(*n).map(|t| t.schema().clone()))
            .collect()
    }

    /// 执行指定工具，永不返回 Err
    pub async fn execute(&self, name: &str, params: Value, ctx: &AgentContext) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            tracing::warn!(tool = %name, "unknown tool requested");
            return ToolResult::err(format!("Tool {name} not found"));
        };

        if let Err(reason) = tool.schema().validate(&params) {
            tracing::warn!(tool = %name, %reason, "tool arguments rejected");
            return ToolResult::err(format!("Invalid arguments for {name}: {reason}"));
        }

        let start = Instant::now();
        let args_preview = args_preview(&params);
        let guarded = AssertUnwindSafe(tool.execute(params, ctx)).catch_unwind();
        let result = match timeout(self.timeout, guarded).await {
            Ok(Ok(Ok(data))) => ToolResult::ok(data),
            Ok(Ok(Err(e))) => ToolResult::err(e.to_string()),
            Ok(Err(_panic)) => ToolResult::err(format!("Tool {name} panicked")),
            Err(_) => ToolResult::err(format!("Tool {name} timed out")),
        };

        let outcome = if result.success { "ok" } else { "error" };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": result.success,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit, "tool");
        if let Some(e) = &result.error {
            tracing::warn!(tool = %name, error = %e, "tool failed");
        }
        result
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
