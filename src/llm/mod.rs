//! LLM 层：补全后端抽象与实现（OpenAI 兼容 / Scripted Mock）、计费、共享补全客户端

pub mod client;
pub mod mock;
pub mod openai;
pub mod pricing;
pub mod traits;

pub use client::{context_summary, Completion, CompletionClient, DEFAULT_REQUEST_TIMEOUT};
pub use mock::ScriptedBackend;
pub use openai::OpenAiBackend;
pub use pricing::{estimate_cost_usd, merge_usage, model_price, ModelPrice, TokenUsage, UsageMeter};
pub use traits::{
    BackendError, CompletionBackend, CompletionOutput, CompletionRequest, ContentPart, ImageInput,
    ToolInvocation,
};
