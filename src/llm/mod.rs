//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::{RecordedCall, ScriptStep, ScriptedLlm};
pub use openai::{OpenAiCompatClient, TokenUsage};
pub use traits::{
    ChatMessage, Completion, CompletionOutput, CompletionRequest, LlmClient, LlmError, ModelTier,
    ToolUse, Usage,
};

use crate::config::LlmSection;

/// 按配置创建 LLM 客户端；没有 API Key 时退回 Mock（回显模式）
pub fn create_llm_from_config(section: &LlmSection) -> Result<Arc<dyn LlmClient>, LlmError> {
    match OpenAiCompatClient::from_config(section)? {
        Some(client) => {
            tracing::info!(model = %section.model, "using OpenAI-compatible LLM backend");
            Ok(Arc::new(client))
        }
        None => {
            tracing::warn!("No API key configured (llm.api_key / OPENAI_API_KEY); falling back to mock LLM");
            Ok(Arc::new(ScriptedLlm::default()))
        }
    }
}
