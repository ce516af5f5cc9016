//! 工具调用器
//!
//! 对每次调用施加超时与并发上限（Agent 画像中的 tool_limit），把结果映射为 ToolCallOutcome，
//! 并输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::agents::AgentType;
use crate::tools::{ToolCallOutcome, ToolSession};

/// 工具调用器：每个 Agent 一个实例，进程内常驻
///
/// 并发许可在该 Agent 的所有会话之间共享，tool_limit 是整个进程对该 Agent 的同时调用上限。
pub struct ToolInvoker {
    agent: AgentType,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ToolInvoker {
    pub fn new(agent: AgentType, tool_limit: usize, timeout: Duration) -> Self {
        Self {
            agent,
            timeout,
            permits: Arc::new(Semaphore::new(tool_limit.max(1))),
        }
    }

    /// 可用的并发许可数
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// 在超时内调用工具；失败与超时都转为 ToolCallOutcome，不向上抛错
    pub async fn call(&self, session: &dyn ToolSession, tool_name: &str, args: Value) -> ToolCallOutcome {
        let start = Instant::now();
        let args_preview = args_preview(&args);

        let outcome = match self.permits.acquire().await {
            Ok(_permit) => match timeout(self.timeout, session.call_tool(tool_name, args)).await {
                Ok(Ok(text)) => ToolCallOutcome::Success(text),
                Ok(Err(e)) => ToolCallOutcome::Error(e.to_string()),
                Err(_) => ToolCallOutcome::Timeout,
            },
            Err(_) => ToolCallOutcome::Error("tool permits closed".to_string()),
        };

        let (ok, label) = match &outcome {
            ToolCallOutcome::Success(_) => (true, "ok"),
            ToolCallOutcome::Error(_) => (false, "error"),
            ToolCallOutcome::Timeout => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "agent": self.agent.as_str(),
            "tool": tool_name,
            "ok": ok,
            "outcome": label,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        outcome
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
