//! 长期记忆：按 (用户, Agent) 保存偏好、习得模式、教训与自定义校验规则
//!
//! 编排器每轮读取一次（get），回复后异步写回（record_interaction）。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::agents::AgentType;
use crate::llm::LlmError;

/// 长期记忆读写错误
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Memory storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Memory encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Memory analysis failed: {0}")]
    Analysis(#[from] LlmError),
}

/// 输出偏好
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            output_style: Some("concise".to_string()),
            tone: Some("professional".to_string()),
            format: None,
        }
    }
}

/// 习得的模式，confidence 取值 0-1
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub pattern: String,
    #[serde(default)]
    pub examples: Vec<String>,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    pub date: String,
    pub lesson: String,
    #[serde(default)]
    pub applied: bool,
}

/// 某用户与某 Agent 之间的记忆
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMemory {
    pub user_id: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub preferences: Preferences,
    #[serde(default)]
    pub patterns: Vec<LearnedPattern>,
    #[serde(default)]
    pub lessons_learned: Vec<Lesson>,
    /// 用户自定义规则，每条由 LLM 做是/否判定
    #[serde(default)]
    pub verification_rules: Vec<String>,
}

impl AgentMemory {
    pub fn new(user_id: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            user_id: user_id.into(),
            agent_type,
            preferences: Preferences::default(),
            patterns: Vec::new(),
            lessons_learned: Vec::new(),
            verification_rules: Vec::new(),
        }
    }

    /// 置信度高于 min 的模式，按置信度降序，最多 limit 条
    pub fn top_patterns(&self, min: f32, limit: usize) -> Vec<&LearnedPattern> {
        let mut patterns: Vec<&LearnedPattern> =
            self.patterns.iter().filter(|p| p.confidence > min).collect();
        patterns.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        patterns.truncate(limit);
        patterns
    }
}

/// 一轮交互的摘要，供学习使用
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub user_message: String,
    pub assistant_response: String,
    pub was_approved: bool,
    pub confidence: u8,
}

/// 长期记忆 trait：读取与学习
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    /// 读取记忆；不存在时返回默认记忆
    async fn get(&self, user_id: &str, agent: AgentType) -> Result<AgentMemory, MemoryError>;

    /// 从一次交互中学习（调用方不等待结果）
    async fn record_interaction(
        &self,
        user_id: &str,
        agent: AgentType,
        interaction: Interaction,
    ) -> Result<(), MemoryError>;
}

/// 空实现：未启用长期记忆时使用
#[derive(Clone, Default)]
pub struct NoopLongTerm;

#[async_trait]
impl LongTermMemory for NoopLongTerm {
    async fn get(&self, user_id: &str, agent: AgentType) -> Result<AgentMemory, MemoryError> {
        Ok(AgentMemory::new(user_id, agent))
    }

    async fn record_interaction(
        &self,
        _user_id: &str,
        _agent: AgentType,
        _interaction: Interaction,
    ) -> Result<(), MemoryError> {
        Ok(())
    }
}

/// 记忆的存取后端（SQLite / 内存）
#[async_trait]
pub trait MemoryStore: Send + Sync {
    async fn load(&self, user_id: &str, agent: AgentType) -> Result<Option<AgentMemory>, MemoryError>;
    async fn save(&self, memory: &AgentMemory) -> Result<(), MemoryError>;
}

/// 内存实现（测试与无数据库场景）
#[derive(Default)]
pub struct InMemoryMemoryStore {
    memories: RwLock<HashMap<(String, AgentType), AgentMemory>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn load(&self, user_id: &str, agent: AgentType) -> Result<Option<AgentMemory>, MemoryError> {
        Ok(self
            .memories
            .read()
            .await
            .get(&(user_id.to_string(), agent))
            .cloned())
    }

    async fn save(&self, memory: &AgentMemory) -> Result<(), MemoryError> {
        self.memories
            .write()
            .await
            .insert((memory.user_id.clone(), memory.agent_type), memory.clone());
        Ok(())
    }
}
