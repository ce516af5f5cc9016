//! 进程内工具：Tool trait + 按 Agent 分组的注册表
//!
//! LocalToolBridge 把注册表包装成 ToolBridge，无需外部工具服务器即可给 Agent 提供工具，
//! 测试中也用它代替 stdio 服务器。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::agents::AgentType;
use crate::tools::{ToolBridge, ToolError, ToolSession, ToolSpec};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.parameters_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

/// 进程内工具桥：每个 Agent 一个注册表
#[derive(Default, Clone)]
pub struct LocalToolBridge {
    registries: HashMap<AgentType, ToolRegistry>,
}

impl LocalToolBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(mut self, agent: AgentType, registry: ToolRegistry) -> Self {
        self.registries.insert(agent, registry);
        self
    }
}

#[async_trait]
impl ToolBridge for LocalToolBridge {
    async fn connect(&self, agent: AgentType) -> Result<Arc<dyn ToolSession>, ToolError> {
        let registry = self
            .registries
            .get(&agent)
            .cloned()
            .ok_or(ToolError::NotConfigured(agent))?;
        Ok(Arc::new(LocalToolSession {
            registry,
            closed: std::sync::atomic::AtomicBool::new(false),
        }))
    }
}

struct LocalToolSession {
    registry: ToolRegistry,
    closed: std::sync::atomic::AtomicBool,
}

impl LocalToolSession {
    fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolSession for LocalToolSession {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        if self.is_closed() {
            return Err(ToolError::Closed);
        }
        Ok(self.registry.specs())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, ToolError> {
        if self.is_closed() {
            return Err(ToolError::Closed);
        }
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::Remote {
                code: -32601,
                message: format!("Unknown tool: {}", name),
            })?;
        tool.execute(args).await.map_err(ToolError::Failed)
    }

    async fn close(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "uppercase text"
        }

        async fn execute(&self, args: Value) -> Result<String, String> {
            args.get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_uppercase())
                .ok_or_else(|| "missing text".to_string())
        }
    }

    fn bridge() -> LocalToolBridge {
        let mut reg = ToolRegistry::new();
        reg.register(Upper);
        LocalToolBridge::new().with_registry(AgentType::Coder, reg)
    }

    #[tokio::test]
    async fn test_local_session_calls() {
        let session = bridge().connect(AgentType::Coder).await.unwrap();
        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "upper");

        let out = session.call_tool("upper", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "HI");

        let err = session.call_tool("upper", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Failed(_)));

        let err = session.call_tool("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Remote { code: -32601, .. }));

        session.close().await;
        assert!(matches!(session.list_tools().await, Err(ToolError::Closed)));
    }

    #[tokio::test]
    async fn test_unconfigured_agent() {
        assert!(bridge().connect(AgentType::Design).await.is_err());
    }
}
