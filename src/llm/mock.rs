//! Scripted 补全后端（用于测试与离线运行，无需 API）
//!
//! 按顺序弹出预置的回复 / 失败 / 挂起；队列为空时返回默认文本。记录所有收到的请求，便于断言 prompt 内容。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::llm::{BackendError, CompletionBackend, CompletionOutput, CompletionRequest, ToolInvocation};
use crate::tools::ToolFormat;

/// 单步脚本
#[derive(Debug, Clone)]
enum Step {
    Reply(CompletionOutput),
    Status(u16, String),
    Hang,
}

/// 脚本化后端
pub struct ScriptedBackend {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<CompletionRequest>>,
    cancelled: AtomicUsize,
    default_reply: String,
    tool_format: ToolFormat,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
            default_reply: "I'm running in offline mode and can't reach the AI service right now."
                .to_string(),
            tool_format: ToolFormat::OpenAi,
        }
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    pub fn with_tool_format(mut self, format: ToolFormat) -> Self {
        self.tool_format = format;
        self
    }

    /// 追加一条文本回复（10 in / 5 out tokens）
    pub fn reply(self, content: impl Into<String>) -> Self {
        self.reply_with_usage(content, 10, 5)
    }

    pub fn reply_with_usage(self, content: impl Into<String>, input_tokens: u64, output_tokens: u64) -> Self {
        self.push(Step::Reply(CompletionOutput {
            content: content.into(),
            tool_calls: Vec::new(),
            input_tokens,
            output_tokens,
        }))
    }

    /// 追加一条结构化工具调用回复
    pub fn tool_call(self, name: &str, arguments: serde_json::Value) -> Self {
        self.push(Step::Reply(CompletionOutput {
            content: String::new(),
            tool_calls: vec![ToolInvocation {
                id: format!("call_{name}"),
                name: name.to_string(),
                arguments,
            }],
            input_tokens: 10,
            output_tokens: 5,
        }))
    }

    /// 追加一次非成功状态码失败
    pub fn fail_status(self, status: u16, body: impl Into<String>) -> Self {
        self.push(Step::Status(status, body.into()))
    }

    /// 追加一次永不返回的请求（用于超时测试）
    pub fn hang(self) -> Self {
        self.push(Step::Hang)
    }

    fn push(self, step: Step) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(step);
        }
        self
    }

    /// 已收到的请求副本
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 挂起的请求中收到取消信号的次数
    pub fn cancelled_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// 剩余未消费的脚本步数
    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn tool_format(&self) -> ToolFormat {
        self.tool_format
    }

    async fn send(
        &self,
        request: &CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionOutput, BackendError> {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
        let step = self.steps.lock().ok().and_then(|mut s| s.pop_front());
        match step {
            Some(Step::Reply(out)) => Ok(out),
            Some(Step::Status(status, body)) => Err(BackendError::Status { status, body }),
            Some(Step::Hang) => {
                cancel.cancelled().await;
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(BackendError::Cancelled)
            }
            None => Ok(CompletionOutput {
                content: self.default_reply.clone(),
                tool_calls: Vec::new(),
                input_tokens: 0,
                output_tokens: 0,
            }),
        }
    }
}
