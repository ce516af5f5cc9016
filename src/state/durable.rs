//! 冷存储：SQLite 中的会话与消息
//!
//! 消息以 (conversation_id, created_at, content) 唯一，INSERT OR IGNORE 保证重放同一快照不产生重复行。
//! 时间戳统一存为纳秒精度的 RFC3339（UTC, Z 结尾），字典序即时间序。

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::agents::AgentType;
use crate::memory::{ConversationMetadata, ConversationState, Message, Role};
use crate::state::StateError;

/// 会话列表项
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub agent_type: AgentType,
    pub last_message_at: DateTime<Utc>,
    pub message_count: usize,
}

/// 单个会话统计
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStats {
    pub agent_type: AgentType,
    pub message_count: usize,
    pub tokens_used: u64,
    pub duration_secs: i64,
}

/// 冷存储接口
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// 写入会话快照：更新会话行，只插入尚不存在的消息；返回新插入的消息数
    async fn sync(&self, state: &ConversationState) -> Result<u64, StateError>;

    /// 从冷存储重建会话（消息按创建时间排序）
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>, StateError>;

    /// 某用户最近的会话
    async fn recent_conversations(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, StateError>;

    async fn conversation_stats(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationStats>, StateError>;

    /// 删除最后活跃早于 days 天前的会话及其消息，返回删除的会话数
    async fn purge_older_than(&self, days: i64) -> Result<u64, StateError>;
}

pub(crate) fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, StateError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StateError::Corrupt(format!("timestamp {}: {}", s, e)))
}

fn parse_agent(s: &str) -> Result<AgentType, StateError> {
    s.parse().map_err(StateError::Corrupt)
}

/// SQLite 冷存储
#[derive(Clone)]
pub struct SqliteDurableStore {
    pool: SqlitePool,
}

impl SqliteDurableStore {
    /// 使用已有连接池并建表
    pub async fn new(pool: SqlitePool) -> Result<Self, StateError> {
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}',
                started_at TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                meta TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (conversation_id, created_at, content),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversations_user ON conversations(user_id, last_message_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// 消息表行数（测试与统计用）
    pub async fn message_rows(&self, conversation_id: &str) -> Result<i64, StateError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn sync(&self, state: &ConversationState) -> Result<u64, StateError> {
        let context = serde_json::to_string(&state.context)?;
        let now = ts(&Utc::now());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO conversations
                (id, user_id, agent_type, context, started_at, last_message_at, message_count, tokens_used, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                agent_type = excluded.agent_type,
                context = excluded.context,
                last_message_at = excluded.last_message_at,
                message_count = excluded.message_count,
                tokens_used = excluded.tokens_used,
                updated_at = excluded.updated_at",
        )
        .bind(&state.conversation_id)
        .bind(&state.user_id)
        .bind(state.agent_type.as_str())
        .bind(&context)
        .bind(ts(&state.metadata.started_at))
        .bind(ts(&state.metadata.last_message_at))
        .bind(state.messages.len() as i64)
        .bind(state.metadata.tokens_used as i64)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let mut inserted = 0u64;
        for m in &state.messages {
            let attachments = serde_json::to_string(&m.attachments)?;
            let meta = m.meta.as_ref().map(serde_json::to_string).transpose()?;
            let result = sqlx::query(
                "INSERT OR IGNORE INTO messages (conversation_id, role, content, attachments, meta, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&state.conversation_id)
            .bind(m.role.as_str())
            .bind(&m.content)
            .bind(&attachments)
            .bind(meta)
            .bind(ts(&m.created_at))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>, StateError> {
        let Some(row) = sqlx::query(
            "SELECT user_id, agent_type, context, started_at, last_message_at, tokens_used
             FROM conversations WHERE id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let context: Map<String, Value> = serde_json::from_str(row.get::<String, _>("context").as_str())?;
        let mut state = ConversationState {
            conversation_id: conversation_id.to_string(),
            user_id: row.get("user_id"),
            agent_type: parse_agent(row.get::<String, _>("agent_type").as_str())?,
            messages: Vec::new(),
            context,
            metadata: ConversationMetadata {
                started_at: parse_ts(row.get::<String, _>("started_at").as_str())?,
                last_message_at: parse_ts(row.get::<String, _>("last_message_at").as_str())?,
                message_count: 0,
                tokens_used: row.get::<i64, _>("tokens_used").max(0) as u64,
            },
        };

        let rows = sqlx::query(
            "SELECT role, content, attachments, meta, created_at FROM messages
             WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        for r in rows {
            let role_str: String = r.get("role");
            let role = Role::parse(&role_str)
                .ok_or_else(|| StateError::Corrupt(format!("role {}", role_str)))?;
            let meta: Option<String> = r.get("meta");
            let meta = meta.map(|m| serde_json::from_str(&m)).transpose()?;
            state.messages.push(Message {
                role,
                content: r.get("content"),
                attachments: serde_json::from_str(r.get::<String, _>("attachments").as_str())?,
                meta,
                created_at: parse_ts(r.get::<String, _>("created_at").as_str())?,
            });
        }
        state.refresh_metadata();
        Ok(Some(state))
    }

    async fn recent_conversations(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, StateError> {
        let rows = sqlx::query(
            "SELECT id, agent_type, last_message_at, message_count FROM conversations
             WHERE user_id = ? ORDER BY last_message_at DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(ConversationSummary {
                    conversation_id: r.get("id"),
                    agent_type: parse_agent(r.get::<String, _>("agent_type").as_str())?,
                    last_message_at: parse_ts(r.get::<String, _>("last_message_at").as_str())?,
                    message_count: r.get::<i64, _>("message_count").max(0) as usize,
                })
            })
            .collect()
    }

    async fn conversation_stats(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationStats>, StateError> {
        let Some(row) = sqlx::query(
            "SELECT c.agent_type, c.started_at, c.last_message_at, c.tokens_used, COUNT(m.id) AS n
             FROM conversations c LEFT JOIN messages m ON m.conversation_id = c.id
             WHERE c.id = ?
             GROUP BY c.id",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let started = parse_ts(row.get::<String, _>("started_at").as_str())?;
        let last = parse_ts(row.get::<String, _>("last_message_at").as_str())?;
        Ok(Some(ConversationStats {
            agent_type: parse_agent(row.get::<String, _>("agent_type").as_str())?,
            message_count: row.get::<i64, _>("n").max(0) as usize,
            tokens_used: row.get::<i64, _>("tokens_used").max(0) as u64,
            duration_secs: (last - started).num_seconds(),
        }))
    }

    async fn purge_older_than(&self, days: i64) -> Result<u64, StateError> {
        let cutoff = ts(&(Utc::now() - chrono::Duration::days(days)));
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM messages WHERE conversation_id IN
                (SELECT id FROM conversations WHERE last_message_at < ?)",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?;
        let deleted = sqlx::query("DELETE FROM conversations WHERE last_message_at < ?")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if deleted > 0 {
            tracing::info!(deleted, days, "purged old conversations");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::memory::{AttachmentRef, MessageMeta};

    async fn store() -> SqliteDurableStore {
        SqliteDurableStore::new(memory_pool().await.unwrap()).await.unwrap()
    }

    fn sample() -> ConversationState {
        let mut state = ConversationState::new("c1", "u1", AgentType::Analyst);
        state.push(
            Message::user("see chart")
                .with_attachments(vec![AttachmentRef::new("a1", "chart.png", "image/png", 10)]),
        );
        state.push(Message::assistant("sales up 10%").with_meta(MessageMeta {
            confidence: Some(90),
            verified: true,
            ..Default::default()
        }));
        state.context.insert("sheets".into(), serde_json::json!({"rows": 3}));
        state.metadata.tokens_used = 42;
        state
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let store = store().await;
        let state = sample();
        assert_eq!(store.sync(&state).await.unwrap(), 2);
        assert_eq!(store.sync(&state).await.unwrap(), 0);
        assert_eq!(store.message_rows("c1").await.unwrap(), 2);

        let mut more = state.clone();
        more.push(Message::user("and costs?"));
        assert_eq!(store.sync(&more).await.unwrap(), 1);
        assert_eq!(store.message_rows("c1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_load_round_trip() {
        let store = store().await;
        let state = sample();
        store.sync(&state).await.unwrap();
        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.messages, state.messages);
        assert_eq!(loaded.context, state.context);
        assert_eq!(loaded.agent_type, AgentType::Analyst);
        assert_eq!(loaded.metadata.message_count, 2);
        assert_eq!(loaded.metadata.tokens_used, 42);
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_and_stats() {
        let store = store().await;
        store.sync(&sample()).await.unwrap();
        let mut other = ConversationState::new("c2", "u1", AgentType::Coder);
        other.push(Message::user("hi"));
        store.sync(&other).await.unwrap();

        let recent = store.recent_conversations("u1", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].conversation_id, "c2");
        assert_eq!(store.recent_conversations("u1", 1).await.unwrap().len(), 1);
        assert!(store.recent_conversations("nobody", 10).await.unwrap().is_empty());

        let stats = store.conversation_stats("c1").await.unwrap().unwrap();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.tokens_used, 42);
        assert_eq!(stats.agent_type, AgentType::Analyst);
        assert!(store.conversation_stats("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let store = store().await;
        let mut old = ConversationState::new("old", "u1", AgentType::Coder);
        let long_ago = Utc::now() - chrono::Duration::days(60);
        old.metadata.started_at = long_ago;
        old.push(Message::user("ancient").at(long_ago));
        store.sync(&old).await.unwrap();
        store.sync(&sample()).await.unwrap();

        assert_eq!(store.purge_older_than(30).await.unwrap(), 1);
        assert!(store.load("old").await.unwrap().is_none());
        assert_eq!(store.message_rows("old").await.unwrap(), 0);
        assert!(store.load("c1").await.unwrap().is_some());
    }
}
