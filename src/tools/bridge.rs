//! 工具桥接抽象
//!
//! 每轮对话为当前 Agent 建立一个 ToolSession（连接其工具服务器），轮次结束时关闭。
//! 单次调用结果统一为 ToolCallOutcome，成功与失败都会回填给 LLM。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::agents::AgentType;

/// 工具描述（来自工具服务器的 tools/list）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// 工具桥接错误
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("No tool server configured for agent {0}")]
    NotConfigured(AgentType),

    #[error("Tool server spawn failed: {0}")]
    Spawn(String),

    #[error("Tool server handshake failed: {0}")]
    Handshake(String),

    #[error("Tool protocol error: {0}")]
    Protocol(String),

    #[error("Tool server returned error {code}: {message}")]
    Remote { code: i64, message: String },

    /// 工具自身执行失败（服务器正常返回 isError）
    #[error("Tool failed: {0}")]
    Failed(String),

    #[error("Tool session closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 一次工具调用的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "output", rename_all = "lowercase")]
pub enum ToolCallOutcome {
    Success(String),
    Error(String),
    Timeout,
}

impl ToolCallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolCallOutcome::Success(_))
    }

    /// 回填给 LLM 的文本
    pub fn feedback(&self, tool_name: &str) -> String {
        match self {
            ToolCallOutcome::Success(text) => text.clone(),
            ToolCallOutcome::Error(e) => format!("Tool {} failed: {}", tool_name, e),
            ToolCallOutcome::Timeout => format!("Tool {} timed out", tool_name),
        }
    }

    /// 写入会话 context 的 JSON
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// 一个已连接的工具会话
#[async_trait]
pub trait ToolSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError>;

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, ToolError>;

    /// 释放连接；重复调用无副作用
    async fn close(&self);
}

/// 按 Agent 建立工具会话
#[async_trait]
pub trait ToolBridge: Send + Sync {
    async fn connect(&self, agent: AgentType) -> Result<Arc<dyn ToolSession>, ToolError>;
}

/// 不提供任何工具
#[derive(Debug, Clone, Default)]
pub struct NoTools;

#[async_trait]
impl ToolBridge for NoTools {
    async fn connect(&self, agent: AgentType) -> Result<Arc<dyn ToolSession>, ToolError> {
        Err(ToolError::NotConfigured(agent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_feedback_and_json() {
        let ok = ToolCallOutcome::Success("42".into());
        assert!(ok.is_success());
        assert_eq!(ok.feedback("calc"), "42");
        assert_eq!(ok.to_json(), json!({"status": "success", "output": "42"}));

        let err = ToolCallOutcome::Error("bad input".into());
        assert_eq!(err.feedback("calc"), "Tool calc failed: bad input");

        let t = ToolCallOutcome::Timeout;
        assert_eq!(t.feedback("calc"), "Tool calc timed out");
        assert_eq!(t.to_json(), json!({"status": "timeout"}));
    }

    #[test]
    fn test_tool_spec_from_list_result() {
        let v = json!({"name": "lookup", "inputSchema": {"type": "object", "properties": {"q": {"type": "string"}}}});
        let spec: ToolSpec = serde_json::from_value(v).unwrap();
        assert_eq!(spec.name, "lookup");
        assert_eq!(spec.description, "");
        assert_eq!(spec.input_schema["properties"]["q"]["type"], "string");
    }

    #[tokio::test]
    async fn test_no_tools_bridge() {
        let err = NoTools.connect(AgentType::Design).await.err().unwrap();
        assert!(matches!(err, ToolError::NotConfigured(AgentType::Design)));
    }
}
