//! KnowledgeManager：带授权与缓存的知识库访问
//!
//! 读路径按数据源权限过滤（至少 Secondary），写路径要求 Primary。
//! 缓存键以 `kb:{agent}:v{version}:` 开头，写入后版本号递增，旧键不再命中，
//! 由 purge_cache 在后台清扫时连同过期项一起删除。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::agents::{AgentProfiles, AgentType, Authority, SourceType};
use crate::cache::TtlCache;
use crate::config::KnowledgeSection;
use crate::knowledge::{
    EntryFilter, KnowledgeEntry, KnowledgeError, KnowledgeQuery, KnowledgeRepository,
    KnowledgeStats, NewKnowledgeEntry,
};
use crate::llm::LlmClient;

/// 单个查询缓存的最大条目数；分页在缓存结果上切片
const MAX_CACHED_ENTRIES: usize = 500;
const CATEGORY_TTL: Duration = Duration::from_secs(24 * 3600);
const SEARCH_ANSWER_TOKENS: u32 = 100;
const SEMANTIC_PICKS: usize = 3;

pub struct KnowledgeManager {
    repo: Arc<dyn KnowledgeRepository>,
    profiles: Arc<AgentProfiles>,
    llm: Option<Arc<dyn LlmClient>>,
    settings: KnowledgeSection,
    entries: TtlCache<Vec<KnowledgeEntry>>,
    categories: TtlCache<Vec<String>>,
    versions: HashMap<AgentType, AtomicU64>,
}

impl KnowledgeManager {
    pub fn new(
        repo: Arc<dyn KnowledgeRepository>,
        profiles: Arc<AgentProfiles>,
        settings: KnowledgeSection,
    ) -> Self {
        Self {
            repo,
            profiles,
            llm: None,
            settings,
            entries: TtlCache::new(),
            categories: TtlCache::new(),
            versions: AgentType::ALL
                .into_iter()
                .map(|a| (a, AtomicU64::new(0)))
                .collect(),
        }
    }

    /// 启用语义检索（关键词命中不足时由 LLM 挑选）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    fn version(&self, agent: AgentType) -> u64 {
        self.versions
            .get(&agent)
            .map(|v| v.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn key_prefix(&self, agent: AgentType) -> String {
        format!("kb:{}:v{}:", agent, self.version(agent))
    }

    /// 使该 Agent 的全部缓存失效
    pub fn invalidate(&self, agent: AgentType) {
        if let Some(v) = self.versions.get(&agent) {
            v.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// 授权后的有效条目；越权或未知数据源返回空，存储错误也返回空
    pub async fn query(&self, agent: AgentType, query: &KnowledgeQuery) -> Vec<KnowledgeEntry> {
        let source_type = match query.source_type.as_deref() {
            None => None,
            Some(raw) => match raw.parse::<SourceType>() {
                Ok(source) if self.profiles.get(agent).has_authority(source, Authority::Secondary) => {
                    Some(source)
                }
                Ok(source) => {
                    tracing::warn!(agent = %agent, source = %source, "knowledge query on unauthorized source");
                    return Vec::new();
                }
                Err(_) => {
                    tracing::warn!(agent = %agent, source = raw, "knowledge query on unknown source");
                    return Vec::new();
                }
            },
        };

        let key = format!(
            "{}query:{}:{}:{}",
            self.key_prefix(agent),
            query.category.as_deref().unwrap_or("all"),
            query.search.as_deref().unwrap_or("all"),
            source_type.map(|s| s.as_str()).unwrap_or("all"),
        );

        let all = match self.entries.get(&key).await {
            Some(cached) => cached,
            None => {
                let filter = EntryFilter {
                    agent,
                    category: query.category.clone(),
                    search: query.search.clone(),
                    source_type,
                    limit: MAX_CACHED_ENTRIES,
                };
                match self.repo.list(&filter).await {
                    Ok(found) => {
                        self.entries
                            .set(key, found.clone(), Duration::from_secs(self.settings.query_ttl_secs))
                            .await;
                        found
                    }
                    Err(e) => {
                        tracing::warn!(agent = %agent, "knowledge query failed: {}", e);
                        return Vec::new();
                    }
                }
            }
        };

        all.into_iter().skip(query.offset).take(query.limit).collect()
    }

    /// 关键词检索；命中不足 limit 时用 LLM 在候选中补充语义相关条目
    pub async fn search(&self, agent: AgentType, text: &str, limit: usize) -> Vec<KnowledgeEntry> {
        let key = format!("{}search:{}:{}", self.key_prefix(agent), limit, text);
        if let Some(cached) = self.entries.get(&key).await {
            return cached;
        }

        let keyword = self
            .query(agent, &KnowledgeQuery::new().search(text).limit(limit * 2))
            .await;

        let merged = if keyword.len() >= limit {
            keyword
        } else {
            match &self.llm {
                Some(llm) => self.semantic_merge(llm.as_ref(), agent, text, keyword).await,
                None => keyword,
            }
        };

        let result: Vec<KnowledgeEntry> = merged.into_iter().take(limit).collect();
        self.entries
            .set(key, result.clone(), Duration::from_secs(self.settings.search_ttl_secs))
            .await;
        result
    }

    async fn semantic_merge(
        &self,
        llm: &dyn LlmClient,
        agent: AgentType,
        text: &str,
        keyword: Vec<KnowledgeEntry>,
    ) -> Vec<KnowledgeEntry> {
        let candidates = self
            .query(agent, &KnowledgeQuery::new().limit(self.settings.semantic_candidates))
            .await;
        if candidates.is_empty() {
            return keyword;
        }

        let listing: Vec<String> = candidates
            .iter()
            .map(|e| format!("{} | {} | {}...", e.key, e.category, truncate(&e.value, 100)))
            .collect();
        let prompt = format!(
            "Given the search query: \"{}\"\n\n\
             And these knowledge base entries (format: KEY | CATEGORY | VALUE):\n{}\n\n\
             Return only the {} most relevant entry KEYs that match the intent of the search query.\n\
             Format: comma-separated list of keys, nothing else.",
            text,
            listing.join("\n"),
            SEMANTIC_PICKS
        );

        let answer = match llm.ask(&prompt, SEARCH_ANSWER_TOKENS).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(agent = %agent, "semantic search failed, using keyword results: {}", e);
                return keyword;
            }
        };
        let picked: HashSet<String> = answer
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();

        let mut seen: HashSet<String> = keyword.iter().map(|e| e.id.clone()).collect();
        let mut merged = keyword;
        for entry in candidates {
            if picked.contains(&entry.key) && seen.insert(entry.id.clone()) {
                merged.push(entry);
            }
        }
        merged
    }

    /// 写入条目；需要该数据源的 Primary 权限，越权时不写入
    pub async fn add(&self, entry: NewKnowledgeEntry) -> Result<KnowledgeEntry, KnowledgeError> {
        let agent = entry.agent_type;
        if !self
            .profiles
            .get(agent)
            .has_authority(entry.source_type, Authority::Primary)
        {
            tracing::warn!(agent = %agent, source = %entry.source_type, "knowledge write rejected");
            return Err(KnowledgeError::UnauthorizedSource {
                agent,
                source_type: entry.source_type,
            });
        }
        let created = self.repo.insert(entry).await?;
        self.invalidate(agent);
        tracing::info!(agent = %agent, key = %created.key, category = %created.category, "knowledge entry added");
        Ok(created)
    }

    /// 退役条目（软删除）；权限规则同 add
    pub async fn retire(&self, agent: AgentType, id: &str) -> Result<bool, KnowledgeError> {
        let entry = self
            .repo
            .get(id)
            .await?
            .filter(|e| e.agent_type == agent)
            .ok_or_else(|| KnowledgeError::NotFound(id.to_string()))?;
        if !self
            .profiles
            .get(agent)
            .has_authority(entry.source_type, Authority::Primary)
        {
            return Err(KnowledgeError::UnauthorizedSource {
                agent,
                source_type: entry.source_type,
            });
        }
        let retired = self.repo.deactivate(id).await?;
        if retired {
            self.invalidate(agent);
            tracing::info!(agent = %agent, id, "knowledge entry retired");
        }
        Ok(retired)
    }

    /// 组装注入系统提示词的知识块；无条目时返回空串
    pub async fn build_context(&self, agent: AgentType, categories: Option<&[String]>) -> String {
        let category = categories.and_then(|c| c.first()).cloned();
        let mut query = KnowledgeQuery::new().limit(self.settings.context_entries);
        query.category = category;
        let entries = self.query(agent, &query).await;
        if entries.is_empty() {
            return String::new();
        }

        let mut grouped: Vec<(String, Vec<&KnowledgeEntry>)> = Vec::new();
        for entry in &entries {
            match grouped.iter_mut().find(|(c, _)| *c == entry.category) {
                Some((_, list)) => list.push(entry),
                None => grouped.push((entry.category.clone(), vec![entry])),
            }
        }

        let mut out = String::from("Knowledge Base Reference:\n\n");
        for (category, list) in grouped {
            out.push_str(&format!("**{}:**\n", category));
            for e in list {
                let value = truncate(&e.value, 150);
                let ellipsis = if value.len() < e.value.len() { "..." } else { "" };
                out.push_str(&format!("- **{}**: {}{}\n", e.key, value, ellipsis));
            }
            out.push('\n');
        }
        out
    }

    /// 有效条目的去重分类，按名称排序
    pub async fn categories(&self, agent: AgentType) -> Vec<String> {
        let key = format!("{}categories", self.key_prefix(agent));
        if let Some(cached) = self.categories.get(&key).await {
            return cached;
        }
        match self.repo.categories(agent).await {
            Ok(found) => {
                self.categories.set(key, found.clone(), CATEGORY_TTL).await;
                found
            }
            Err(e) => {
                tracing::warn!(agent = %agent, "knowledge categories failed: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn stats(&self, agent: AgentType) -> KnowledgeStats {
        self.repo.stats(agent).await.unwrap_or_else(|e| {
            tracing::warn!(agent = %agent, "knowledge stats failed: {}", e);
            KnowledgeStats::default()
        })
    }

    /// 清理过期项以及旧版本号下的缓存项，返回清理条数
    pub async fn purge_cache(&self) -> usize {
        let current: Vec<String> = AgentType::ALL.into_iter().map(|a| self.key_prefix(a)).collect();
        let is_current = |key: &str| current.iter().any(|p| key.starts_with(p.as_str()));
        let stale = self.entries.retain_keys(is_current).await + self.categories.retain_keys(is_current).await;
        let expired = self.entries.purge_expired().await + self.categories.purge_expired().await;
        if stale + expired > 0 {
            tracing::debug!(stale, expired, "knowledge cache purged");
        }
        stale + expired
    }

    /// 当前缓存条目数（查询 + 分类）
    pub async fn cached_len(&self) -> usize {
        self.entries.len().await + self.categories.len().await
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::knowledge::SqliteKnowledgeRepository;
    use crate::llm::{ScriptStep, ScriptedLlm};

    async fn manager() -> KnowledgeManager {
        let repo = SqliteKnowledgeRepository::new(memory_pool().await.unwrap())
            .await
            .unwrap();
        KnowledgeManager::new(
            Arc::new(repo),
            Arc::new(AgentProfiles::builtin()),
            KnowledgeSection::default(),
        )
    }

    fn entry(source: SourceType, category: &str, key: &str, value: &str) -> NewKnowledgeEntry {
        NewKnowledgeEntry::new(AgentType::Coder, source, category, key, value)
    }

    #[tokio::test]
    async fn test_unauthorized_source_query_is_empty() {
        let m = manager().await;
        m.add(entry(SourceType::Github, "frameworks", "axum", "web"))
            .await
            .unwrap();
        assert!(m
            .query(AgentType::Coder, &KnowledgeQuery::new().source_type("figma"))
            .await
            .is_empty());
        assert!(m
            .query(AgentType::Coder, &KnowledgeQuery::new().source_type("carrier_pigeon"))
            .await
            .is_empty());
        assert_eq!(
            m.query(AgentType::Coder, &KnowledgeQuery::new().source_type("github"))
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unauthorized_add_persists_nothing() {
        let m = manager().await;
        // Coder 对 manual 只有 Secondary
        let err = m
            .add(entry(SourceType::Manual, "notes", "k", "v"))
            .await
            .unwrap_err();
        assert!(matches!(err, KnowledgeError::UnauthorizedSource { .. }));
        assert_eq!(m.stats(AgentType::Coder).await.total_entries, 0);
    }

    #[tokio::test]
    async fn test_add_invalidates_cached_query() {
        let m = manager().await;
        m.add(entry(SourceType::LocalKb, "patterns", "a", "first"))
            .await
            .unwrap();
        assert_eq!(m.query(AgentType::Coder, &KnowledgeQuery::new()).await.len(), 1);
        m.add(entry(SourceType::LocalKb, "patterns", "b", "second"))
            .await
            .unwrap();
        let found = m.query(AgentType::Coder, &KnowledgeQuery::new()).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].key, "b");
        assert_eq!(m.categories(AgentType::Coder).await, vec!["patterns".to_string()]);
    }

    #[tokio::test]
    async fn test_pagination_slices_results() {
        let m = manager().await;
        for i in 0..5 {
            m.add(entry(SourceType::LocalKb, "patterns", &format!("k{}", i), "v"))
                .await
                .unwrap();
        }
        let page = m
            .query(AgentType::Coder, &KnowledgeQuery::new().limit(2).offset(1))
            .await;
        assert_eq!(page.iter().map(|e| e.key.as_str()).collect::<Vec<_>>(), vec!["k3", "k2"]);
    }

    #[tokio::test]
    async fn test_retire_hides_entry() {
        let m = manager().await;
        let e = m
            .add(entry(SourceType::Github, "frameworks", "axum", "web"))
            .await
            .unwrap();
        assert!(m.retire(AgentType::Coder, &e.id).await.unwrap());
        assert!(m.query(AgentType::Coder, &KnowledgeQuery::new()).await.is_empty());
        assert!(matches!(
            m.retire(AgentType::Design, &e.id).await,
            Err(KnowledgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_search_merges_semantic_picks() {
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptStep::text("retry-policy, unknown")]));
        let m = manager().await.with_llm(llm.clone());
        m.add(entry(SourceType::LocalKb, "resilience", "timeouts", "Always set timeouts"))
            .await
            .unwrap();
        m.add(entry(SourceType::LocalKb, "resilience", "retry-policy", "Exponential backoff"))
            .await
            .unwrap();

        let found = m.search(AgentType::Coder, "timeouts", 3).await;
        let keys: Vec<_> = found.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["timeouts", "retry-policy"]);
        assert_eq!(llm.call_count(), 1);

        // 命中缓存，不再询问 LLM
        m.search(AgentType::Coder, "timeouts", 3).await;
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_search_falls_back_on_llm_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![ScriptStep::error("down")]));
        let m = manager().await.with_llm(llm);
        m.add(entry(SourceType::LocalKb, "resilience", "timeouts", "Always set timeouts"))
            .await
            .unwrap();
        let found = m.search(AgentType::Coder, "timeouts", 3).await;
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_drops_superseded_versions() {
        let m = manager().await;
        for i in 0..10 {
            m.add(entry(SourceType::LocalKb, "patterns", &format!("k{}", i), "v"))
                .await
                .unwrap();
            m.query(AgentType::Coder, &KnowledgeQuery::new()).await;
        }
        m.categories(AgentType::Coder).await;
        assert_eq!(m.cached_len().await, 11);

        assert_eq!(m.purge_cache().await, 9);
        assert_eq!(m.cached_len().await, 2);
        // 当前版本的缓存仍可命中
        assert_eq!(m.query(AgentType::Coder, &KnowledgeQuery::new()).await.len(), 10);
        assert_eq!(m.cached_len().await, 2);
    }

    #[tokio::test]
    async fn test_build_context_format() {
        let m = manager().await;
        assert_eq!(m.build_context(AgentType::Coder, None).await, "");
        let long = "x".repeat(200);
        m.add(entry(SourceType::LocalKb, "patterns", "long", &long))
            .await
            .unwrap();
        let ctx = m.build_context(AgentType::Coder, None).await;
        assert!(ctx.starts_with("Knowledge Base Reference:\n\n**patterns:**\n- **long**: "));
        assert!(ctx.ends_with("...\n\n"));
        assert!(ctx.contains(&"x".repeat(150)));
        assert!(!ctx.contains(&"x".repeat(151)));
    }
}
