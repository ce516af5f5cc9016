//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient：complete（可能返回工具调用）、
//! resume_after_tool（带工具结果继续生成），以及便捷的 ask（单轮短问答，走轻量模型）。

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::attachments::HydratedAttachment;
use crate::memory::Role;
use crate::tools::ToolSpec;

/// LLM 调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Network timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// 选用的模型档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelTier {
    /// 主模型：生成 Agent 回复
    #[default]
    Primary,
    /// 轻量模型：分类、规则判定、检索
    Fast,
}

/// 送入 LLM 的一条消息（附件已水合）
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub attachments: Vec<HydratedAttachment>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_attachments(mut self, attachments: Vec<HydratedAttachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// 一次补全请求
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    pub tier: ModelTier,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system: system.into(),
            messages,
            tools: Vec::new(),
            max_tokens: 4096,
            tier: ModelTier::Primary,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }
}

/// 模型请求的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutput {
    Text(String),
    ToolUse(ToolUse),
}

/// 单次调用的 token 统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub output: CompletionOutput,
    pub usage: Usage,
    pub stop_reason: Option<String>,
}

impl Completion {
    pub fn text(&self) -> Option<&str> {
        match &self.output {
            CompletionOutput::Text(t) => Some(t.as_str()),
            CompletionOutput::ToolUse(_) => None,
        }
    }

    pub fn tool_use(&self) -> Option<&ToolUse> {
        match &self.output {
            CompletionOutput::ToolUse(t) => Some(t),
            CompletionOutput::Text(_) => None,
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 单次补全；模型可能要求调用工具
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    /// 把工具结果交还模型，继续生成
    async fn resume_after_tool(
        &self,
        request: &CompletionRequest,
        tool_use: &ToolUse,
        result: &str,
    ) -> Result<Completion, LlmError>;

    /// 单轮短问答（轻量模型），返回文本
    async fn ask(&self, prompt: &str, max_tokens: u32) -> Result<String, LlmError> {
        let request = CompletionRequest::new("", vec![ChatMessage::user(prompt)])
            .with_max_tokens(max_tokens)
            .with_tier(ModelTier::Fast);
        let completion = self.complete(&request).await?;
        match completion.output {
            CompletionOutput::Text(t) => Ok(t),
            CompletionOutput::ToolUse(t) => Err(LlmError::InvalidResponse(format!(
                "unexpected tool call: {}",
                t.name
            ))),
        }
    }

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
