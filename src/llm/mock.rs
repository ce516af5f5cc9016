//! Mock LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! 按顺序回放预设的回复；剧本用完后回显最后一条 User 消息。记录每次收到的请求，便于断言。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::llm::{
    Completion, CompletionOutput, CompletionRequest, LlmClient, LlmError, ToolUse, Usage,
};
use crate::memory::Role;

/// 剧本中的一步
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Text(String),
    ToolUse { name: String, args: Value },
    Error(String),
}

impl ScriptStep {
    pub fn text(t: impl Into<String>) -> Self {
        ScriptStep::Text(t.into())
    }

    pub fn tool(name: impl Into<String>, args: Value) -> Self {
        ScriptStep::ToolUse {
            name: name.into(),
            args,
        }
    }

    pub fn error(e: impl Into<String>) -> Self {
        ScriptStep::Error(e.into())
    }
}

/// 请求记录：调用类型 + 请求快照
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: CompletionRequest,
    /// resume_after_tool 时带上的工具结果
    pub tool_result: Option<String>,
}

/// 回放预设回复的 Mock 客户端
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    script: Mutex<VecDeque<ScriptStep>>,
    calls: Mutex<Vec<RecordedCall>>,
    call_count: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            ..Self::default()
        }
    }

    /// 每次调用前等待一段时间（用于取消测试）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn push(&self, step: ScriptStep) {
        self.script.lock().await.push_back(step);
    }

    /// complete + resume_after_tool 的总调用次数
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    async fn next(&self, request: &CompletionRequest, tool_result: Option<&str>) -> Result<Completion, LlmError> {
        let n = self.call_count.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().await.push(RecordedCall {
            request: request.clone(),
            tool_result: tool_result.map(String::from),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = self.script.lock().await.pop_front();
        let output = match step {
            Some(ScriptStep::Text(t)) => CompletionOutput::Text(t),
            Some(ScriptStep::ToolUse { name, args }) => CompletionOutput::ToolUse(ToolUse {
                id: format!("call_{}", n),
                name,
                args,
            }),
            Some(ScriptStep::Error(e)) => return Err(LlmError::Http(e)),
            None => {
                let last_user = request
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map(|m| m.content.as_str())
                    .unwrap_or("(no input)");
                CompletionOutput::Text(format!("Echo from Mock: {}", last_user))
            }
        };
        let stop_reason = match output {
            CompletionOutput::ToolUse(_) => "tool_calls",
            CompletionOutput::Text(_) => "stop",
        };
        Ok(Completion {
            output,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
            stop_reason: Some(stop_reason.to_string()),
        })
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.next(request, None).await
    }

    async fn resume_after_tool(
        &self,
        request: &CompletionRequest,
        _tool_use: &ToolUse,
        result: &str,
    ) -> Result<Completion, LlmError> {
        self.next(request, Some(result)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use serde_json::json;

    #[tokio::test]
    async fn test_replays_script_then_echoes() {
        let llm = ScriptedLlm::new(vec![
            ScriptStep::text("first"),
            ScriptStep::tool("search", json!({"q": "x"})),
            ScriptStep::error("down"),
        ]);
        let req = CompletionRequest::new("", vec![ChatMessage::user("hello")]);

        let c = llm.complete(&req).await.unwrap();
        assert_eq!(c.text(), Some("first"));
        assert_eq!(c.usage.total(), 15);

        let c = llm.complete(&req).await.unwrap();
        assert_eq!(c.tool_use().unwrap().name, "search");

        assert!(llm.complete(&req).await.is_err());

        let c = llm.complete(&req).await.unwrap();
        assert_eq!(c.text(), Some("Echo from Mock: hello"));
        assert_eq!(llm.call_count(), 4);
    }

    #[tokio::test]
    async fn test_ask_uses_default_helper() {
        let llm = ScriptedLlm::new(vec![ScriptStep::text("yes")]);
        assert_eq!(llm.ask("ok?", 10).await.unwrap(), "yes");
        let calls = llm.calls().await;
        assert_eq!(calls[0].request.max_tokens, 10);
    }
}
