//! 编排器错误类型
//!
//! 校验不通过、工具失败、知识库越权都不是错误：它们以数据形式进入回复。
//! 只有 LLM 不可用、热层不可用、取消与配置错误会让一轮请求失败。

use thiserror::Error;

use crate::llm::LlmError;
use crate::state::StateError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 调用方能否原样重试本轮请求
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentError::Llm(LlmError::Timeout) | AgentError::Llm(LlmError::Http(_)) => true,
            AgentError::Llm(LlmError::Api { status, .. }) => *status == 429 || *status >= 500,
            AgentError::Llm(LlmError::InvalidResponse(_)) => false,
            AgentError::State(e) => e.is_retryable(),
            AgentError::Cancelled | AgentError::Config(_) => false,
        }
    }
}
