//! 知识条目、查询条件与统计

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::agents::{AgentType, SourceType};

/// 知识库条目；退役（is_active = false）后不再被查询到，但不物理删除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    pub id: String,
    pub agent_type: AgentType,
    pub source_type: SourceType,
    pub category: String,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub metadata: Value,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 新建条目的输入
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewKnowledgeEntry {
    pub agent_type: AgentType,
    pub source_type: SourceType,
    pub category: String,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl NewKnowledgeEntry {
    pub fn new(
        agent_type: AgentType,
        source_type: SourceType,
        category: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            agent_type,
            source_type,
            category: category.into(),
            key: key.into(),
            value: value.into(),
            metadata: Value::Object(Default::default()),
            synced_at: None,
        }
    }
}

/// 查询条件；source_type 以字符串传入，未知类型按越权处理
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    10
}

impl Default for KnowledgeQuery {
    fn default() -> Self {
        Self {
            category: None,
            search: None,
            source_type: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl KnowledgeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// 仓储层过滤条件（已通过授权检查）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFilter {
    pub agent: AgentType,
    pub category: Option<String>,
    pub search: Option<String>,
    pub source_type: Option<SourceType>,
    pub limit: usize,
}

/// 某 Agent 的知识库统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeStats {
    pub total_entries: u64,
    pub categories_count: u64,
    pub source_breakdown: BTreeMap<String, u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// 知识层错误
#[derive(Error, Debug)]
pub enum KnowledgeError {
    #[error("Agent {agent} is not authorized to write source {source_type}")]
    UnauthorizedSource {
        agent: AgentType,
        source_type: SourceType,
    },

    #[error("Knowledge entry not found: {0}")]
    NotFound(String),

    #[error("Knowledge storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Knowledge encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Corrupt knowledge row: {0}")]
    Corrupt(String),
}
