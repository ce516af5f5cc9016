//! 长期记忆的 SQLite 持久化
//!
//! 每个 (user_id, agent_type) 一行，记忆整体以 JSON 存储。

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::agents::AgentType;
use crate::memory::{AgentMemory, MemoryError, MemoryStore};

#[derive(Clone)]
pub struct SqliteMemoryStore {
    pool: SqlitePool,
}

impl SqliteMemoryStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, MemoryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_memory (
                user_id TEXT NOT NULL,
                agent_type TEXT NOT NULL,
                memory_data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, agent_type)
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn load(&self, user_id: &str, agent: AgentType) -> Result<Option<AgentMemory>, MemoryError> {
        let row = sqlx::query("SELECT memory_data FROM agent_memory WHERE user_id = ? AND agent_type = ?")
            .bind(user_id)
            .bind(agent.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: String = row.get("memory_data");
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, memory: &AgentMemory) -> Result<(), MemoryError> {
        let data = serde_json::to_string(memory)?;
        sqlx::query(
            "INSERT INTO agent_memory (user_id, agent_type, memory_data, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (user_id, agent_type)
             DO UPDATE SET memory_data = excluded.memory_data, updated_at = excluded.updated_at",
        )
        .bind(&memory.user_id)
        .bind(memory.agent_type.as_str())
        .bind(data)
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    #[tokio::test]
    async fn test_save_and_reload() {
        let store = SqliteMemoryStore::new(memory_pool().await.unwrap()).await.unwrap();
        assert!(store.load("u1", AgentType::Design).await.unwrap().is_none());

        let mut m = AgentMemory::new("u1", AgentType::Design);
        m.verification_rules.push("Mention contrast ratios".into());
        store.save(&m).await.unwrap();
        m.preferences.output_style = Some("detailed".into());
        store.save(&m).await.unwrap();

        assert_eq!(store.load("u1", AgentType::Design).await.unwrap(), Some(m));
        assert!(store.load("u2", AgentType::Design).await.unwrap().is_none());
    }
}
