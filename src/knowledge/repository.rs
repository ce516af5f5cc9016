//! 知识库仓储（sqlx / SQLite）

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;

use crate::agents::AgentType;
use crate::knowledge::{EntryFilter, KnowledgeEntry, KnowledgeError, KnowledgeStats, NewKnowledgeEntry};

/// 知识库存取接口
#[async_trait]
pub trait KnowledgeRepository: Send + Sync {
    /// 有效条目，按创建时间倒序
    async fn list(&self, filter: &EntryFilter) -> Result<Vec<KnowledgeEntry>, KnowledgeError>;

    async fn get(&self, id: &str) -> Result<Option<KnowledgeEntry>, KnowledgeError>;

    async fn insert(&self, entry: NewKnowledgeEntry) -> Result<KnowledgeEntry, KnowledgeError>;

    /// 退役条目；返回是否有行被更新
    async fn deactivate(&self, id: &str) -> Result<bool, KnowledgeError>;

    async fn categories(&self, agent: AgentType) -> Result<Vec<String>, KnowledgeError>;

    async fn stats(&self, agent: AgentType) -> Result<KnowledgeStats, KnowledgeError>;
}

fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, KnowledgeError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| KnowledgeError::Corrupt(format!("timestamp {}: {}", s, e)))
}

const COLUMNS: &str =
    "id, agent_type, source_type, category, key, value, metadata, is_active, synced_at, created_at, updated_at";

/// SQLite 知识库
#[derive(Clone)]
pub struct SqliteKnowledgeRepository {
    pool: SqlitePool,
}

impl SqliteKnowledgeRepository {
    pub async fn new(pool: SqlitePool) -> Result<Self, KnowledgeError> {
        let repo = Self { pool };
        repo.init_tables().await?;
        Ok(repo)
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS knowledge_base (
                id TEXT PRIMARY KEY,
                agent_type TEXT NOT NULL,
                source_type TEXT NOT NULL,
                category TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                is_active INTEGER NOT NULL DEFAULT 1,
                synced_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_kb_agent ON knowledge_base(agent_type, is_active, category)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_entry(row: &SqliteRow) -> Result<KnowledgeEntry, KnowledgeError> {
        let agent: String = row.get("agent_type");
        let source: String = row.get("source_type");
        let synced_at: Option<String> = row.get("synced_at");
        Ok(KnowledgeEntry {
            id: row.get("id"),
            agent_type: agent.parse().map_err(KnowledgeError::Corrupt)?,
            source_type: source.parse().map_err(KnowledgeError::Corrupt)?,
            category: row.get("category"),
            key: row.get("key"),
            value: row.get("value"),
            metadata: serde_json::from_str(row.get::<String, _>("metadata").as_str())?,
            is_active: row.get::<i64, _>("is_active") != 0,
            synced_at: synced_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
            updated_at: parse_ts(row.get::<String, _>("updated_at").as_str())?,
        })
    }
}

#[async_trait]
impl KnowledgeRepository for SqliteKnowledgeRepository {
    async fn list(&self, filter: &EntryFilter) -> Result<Vec<KnowledgeEntry>, KnowledgeError> {
        let mut sql = format!(
            "SELECT {} FROM knowledge_base WHERE agent_type = ? AND is_active = 1",
            COLUMNS
        );
        if filter.category.is_some() {
            sql.push_str(" AND category = ?");
        }
        if filter.source_type.is_some() {
            sql.push_str(" AND source_type = ?");
        }
        if filter.search.is_some() {
            sql.push_str(r" AND (key LIKE ? ESCAPE '\' OR value LIKE ? ESCAPE '\')");
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(filter.agent.as_str());
        if let Some(category) = &filter.category {
            query = query.bind(category.clone());
        }
        if let Some(source) = filter.source_type {
            query = query.bind(source.as_str());
        }
        if let Some(search) = &filter.search {
            let pattern = format!("%{}%", escape_like(search));
            query = query.bind(pattern.clone()).bind(pattern);
        }
        let rows = query.bind(filter.limit as i64).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn get(&self, id: &str) -> Result<Option<KnowledgeEntry>, KnowledgeError> {
        let sql = format!("SELECT {} FROM knowledge_base WHERE id = ?", COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn insert(&self, entry: NewKnowledgeEntry) -> Result<KnowledgeEntry, KnowledgeError> {
        let now = Utc::now();
        let created = KnowledgeEntry {
            id: uuid::Uuid::new_v4().to_string(),
            agent_type: entry.agent_type,
            source_type: entry.source_type,
            category: entry.category,
            key: entry.key,
            value: entry.value,
            metadata: if entry.metadata.is_null() {
                serde_json::json!({})
            } else {
                entry.metadata
            },
            is_active: true,
            synced_at: Some(entry.synced_at.unwrap_or(now)),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO knowledge_base
                (id, agent_type, source_type, category, key, value, metadata, is_active, synced_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&created.id)
        .bind(created.agent_type.as_str())
        .bind(created.source_type.as_str())
        .bind(&created.category)
        .bind(&created.key)
        .bind(&created.value)
        .bind(serde_json::to_string(&created.metadata)?)
        .bind(created.synced_at.as_ref().map(ts))
        .bind(ts(&created.created_at))
        .bind(ts(&created.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(created)
    }

    async fn deactivate(&self, id: &str) -> Result<bool, KnowledgeError> {
        let result = sqlx::query(
            "UPDATE knowledge_base SET is_active = 0, updated_at = ? WHERE id = ? AND is_active = 1",
        )
        .bind(ts(&Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn categories(&self, agent: AgentType) -> Result<Vec<String>, KnowledgeError> {
        let rows = sqlx::query(
            "SELECT DISTINCT category FROM knowledge_base
             WHERE agent_type = ? AND is_active = 1 ORDER BY category",
        )
        .bind(agent.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| r.get::<String, _>("category"))
            .filter(|c| !c.is_empty())
            .collect())
    }

    async fn stats(&self, agent: AgentType) -> Result<KnowledgeStats, KnowledgeError> {
        let rows = sqlx::query(
            "SELECT source_type, COUNT(*) AS total, MAX(updated_at) AS last_updated
             FROM knowledge_base WHERE agent_type = ? AND is_active = 1
             GROUP BY source_type",
        )
        .bind(agent.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut stats = KnowledgeStats::default();
        let mut breakdown = BTreeMap::new();
        for r in &rows {
            let total = r.get::<i64, _>("total").max(0) as u64;
            breakdown.insert(r.get::<String, _>("source_type"), total);
            stats.total_entries += total;
            let last: Option<String> = r.get("last_updated");
            if let Some(last) = last {
                let last = parse_ts(&last)?;
                if stats.last_updated.map(|cur| last > cur).unwrap_or(true) {
                    stats.last_updated = Some(last);
                }
            }
        }
        stats.source_breakdown = breakdown;

        let row = sqlx::query(
            "SELECT COUNT(DISTINCT category) AS n FROM knowledge_base WHERE agent_type = ? AND is_active = 1",
        )
        .bind(agent.as_str())
        .fetch_one(&self.pool)
        .await?;
        stats.categories_count = row.get::<i64, _>("n").max(0) as u64;
        Ok(stats)
    }
}

/// 转义 LIKE 通配符，搜索词按字面子串匹配
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::SourceType;
    use crate::db::memory_pool;

    async fn repo() -> SqliteKnowledgeRepository {
        SqliteKnowledgeRepository::new(memory_pool().await.unwrap()).await.unwrap()
    }

    fn filter(agent: AgentType) -> EntryFilter {
        EntryFilter {
            agent,
            category: None,
            search: None,
            source_type: None,
            limit: 10,
        }
    }

    #[tokio::test]
    async fn test_insert_list_filters() {
        let repo = repo().await;
        repo.insert(NewKnowledgeEntry::new(
            AgentType::Coder,
            SourceType::LocalKb,
            "error_handling",
            "Result",
            "Prefer Result over panics",
        ))
        .await
        .unwrap();
        repo.insert(NewKnowledgeEntry::new(
            AgentType::Coder,
            SourceType::Github,
            "frameworks",
            "axum",
            "Router based web framework",
        ))
        .await
        .unwrap();
        repo.insert(NewKnowledgeEntry::new(
            AgentType::Design,
            SourceType::Figma,
            "typography",
            "Scale",
            "Use a modular type scale",
        ))
        .await
        .unwrap();

        let all = repo.list(&filter(AgentType::Coder)).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "axum");

        let mut f = filter(AgentType::Coder);
        f.category = Some("error_handling".into());
        assert_eq!(repo.list(&f).await.unwrap().len(), 1);

        let mut f = filter(AgentType::Coder);
        f.search = Some("ROUTER".into());
        let hits = repo.list(&f).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source_type, SourceType::Github);

        let mut f = filter(AgentType::Coder);
        f.source_type = Some(SourceType::LocalKb);
        assert_eq!(repo.list(&f).await.unwrap()[0].key, "Result");
    }

    #[tokio::test]
    async fn test_search_treats_wildcards_literally() {
        let repo = repo().await;
        for (key, value) in [
            ("shipped", "100 units shipped"),
            ("discount", "1_0% off for members"),
            ("path", r"C:\data\q3"),
        ] {
            repo.insert(NewKnowledgeEntry::new(AgentType::Coder, SourceType::LocalKb, "notes", key, value))
                .await
                .unwrap();
        }

        let search = |text: &str| {
            let mut f = filter(AgentType::Coder);
            f.search = Some(text.to_string());
            f
        };
        let keys = |found: Vec<KnowledgeEntry>| found.into_iter().map(|e| e.key).collect::<Vec<_>>();

        assert_eq!(keys(repo.list(&search("1_0%")).await.unwrap()), vec!["discount"]);
        assert!(repo.list(&search("1%0")).await.unwrap().is_empty());
        assert_eq!(keys(repo.list(&search(r"\data")).await.unwrap()), vec!["path"]);
        assert_eq!(keys(repo.list(&search("units")).await.unwrap()), vec!["shipped"]);
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off"), r"50\%\_off");
        assert_eq!(escape_like(r"a\b"), r"a\\b");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[tokio::test]
    async fn test_deactivate_hides_entry() {
        let repo = repo().await;
        let e = repo
            .insert(NewKnowledgeEntry::new(AgentType::Analyst, SourceType::Manual, "metrics", "ARPU", "Revenue per user"))
            .await
            .unwrap();
        assert!(repo.deactivate(&e.id).await.unwrap());
        assert!(!repo.deactivate(&e.id).await.unwrap());
        assert!(repo.list(&filter(AgentType::Analyst)).await.unwrap().is_empty());
        let stored = repo.get(&e.id).await.unwrap().unwrap();
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn test_categories_and_stats() {
        let repo = repo().await;
        for (source, cat, key) in [
            (SourceType::LocalKb, "metrics", "a"),
            (SourceType::LocalKb, "benchmarks", "b"),
            (SourceType::GoogleSheets, "metrics", "c"),
        ] {
            repo.insert(NewKnowledgeEntry::new(AgentType::Analyst, source, cat, key, "v"))
                .await
                .unwrap();
        }
        assert_eq!(
            repo.categories(AgentType::Analyst).await.unwrap(),
            vec!["benchmarks".to_string(), "metrics".to_string()]
        );
        let stats = repo.stats(AgentType::Analyst).await.unwrap();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.categories_count, 2);
        assert_eq!(stats.source_breakdown.get("local_kb"), Some(&2));
        assert!(stats.last_updated.is_some());
        assert_eq!(repo.stats(AgentType::Coder).await.unwrap(), KnowledgeStats::default());
    }
}
