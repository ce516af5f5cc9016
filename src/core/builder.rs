//! OrchestratorBuilder：按配置装配全部组件
//!
//! CLI 与 Web 入口共用同一套装配逻辑；测试通过 with_* 替换 LLM、工具、长期记忆等协作者。

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentProfiles, AgentType};
use crate::attachments::{AttachmentResolver, NoopAttachmentResolver};
use crate::config::AppConfig;
use crate::core::{AgentError, Orchestrator, OrchestratorDeps, OrchestratorSettings};
use crate::knowledge::{KnowledgeManager, SqliteKnowledgeRepository};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{LongTermMemory, MemoryManager, SqliteMemoryStore};
use crate::state::{
    DurableStore, HotStore, InMemoryHotStore, SqliteDurableStore, StateStore, SyncQueue, SyncWorker,
};
use crate::tools::{StdioToolBridge, ToolBridge};
use crate::verification::{EscalationDecider, Verifier};

pub struct OrchestratorBuilder {
    config: AppConfig,
    pool: Option<SqlitePool>,
    llm: Option<Arc<dyn LlmClient>>,
    tools: Option<Arc<dyn ToolBridge>>,
    memory: Option<Arc<dyn LongTermMemory>>,
    attachments: Option<Arc<dyn AttachmentResolver>>,
    hot: Option<Arc<dyn HotStore>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            pool: None,
            llm: None,
            tools: None,
            memory: None,
            attachments: None,
            hot: None,
        }
    }

    /// 使用已有连接池（否则按 app.database_url 连接）
    pub fn with_pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolBridge>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_long_term(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_attachment_resolver(mut self, resolver: Arc<dyn AttachmentResolver>) -> Self {
        self.attachments = Some(resolver);
        self
    }

    pub fn with_hot_store(mut self, hot: Arc<dyn HotStore>) -> Self {
        self.hot = Some(hot);
        self
    }

    fn settings(&self) -> Result<OrchestratorSettings, AgentError> {
        let default_agent: AgentType = self
            .config
            .agents
            .default_agent
            .parse()
            .map_err(AgentError::Config)?;
        Ok(OrchestratorSettings {
            context_window: self.config.app.context_window,
            max_attempts: self.config.app.max_attempts,
            max_tokens: self.config.llm.max_tokens,
            default_agent,
            auto_route: self.config.agents.auto_route,
            tool_timeout: Duration::from_secs(self.config.tools.tool_timeout_secs),
        })
    }

    pub async fn build(self) -> Result<Runtime, AgentError> {
        let settings = self.settings()?;
        let cfg = self.config;

        let pool = match self.pool {
            Some(pool) => pool,
            None => crate::db::connect(&cfg.app.database_url)
                .await
                .map_err(|e| AgentError::Config(format!("database {}: {}", cfg.app.database_url, e)))?,
        };

        let llm = match self.llm {
            Some(llm) => llm,
            None => create_llm_from_config(&cfg.llm)?,
        };

        let durable: Arc<dyn DurableStore> = Arc::new(SqliteDurableStore::new(pool.clone()).await?);
        let hot = self.hot.unwrap_or_else(|| Arc::new(InMemoryHotStore::new()));
        let queue = Arc::new(SyncQueue::new());
        let state = Arc::new(StateStore::new(
            hot,
            durable.clone(),
            queue.clone(),
            Duration::from_secs(cfg.state.hot_ttl_secs),
        ));

        let profiles = Arc::new(AgentProfiles::builtin());
        let repo = SqliteKnowledgeRepository::new(pool.clone())
            .await
            .map_err(|e| AgentError::Config(format!("knowledge base: {}", e)))?;
        let knowledge = Arc::new(
            KnowledgeManager::new(Arc::new(repo), profiles.clone(), cfg.knowledge.clone())
                .with_llm(llm.clone()),
        );

        let memory: Arc<dyn LongTermMemory> = match self.memory {
            Some(memory) => memory,
            None => {
                let store = SqliteMemoryStore::new(pool.clone())
                    .await
                    .map_err(|e| AgentError::Config(format!("long-term memory: {}", e)))?;
                Arc::new(MemoryManager::new(Arc::new(store), llm.clone()))
            }
        };

        let tools = self
            .tools
            .unwrap_or_else(|| Arc::new(StdioToolBridge::from_config(&cfg.tools)));
        let attachments = self
            .attachments
            .unwrap_or_else(|| Arc::new(NoopAttachmentResolver));

        let orchestrator = Orchestrator::new(
            OrchestratorDeps {
                profiles,
                state: state.clone(),
                knowledge: knowledge.clone(),
                llm: llm.clone(),
                tools,
                memory,
                attachments,
                verifier: Verifier::new(llm.clone(), cfg.verification.clone()),
                decider: EscalationDecider::new(cfg.verification.escalation_threshold),
            },
            settings,
        );
        tracing::info!(database = %cfg.app.database_url, "orchestrator ready");

        Ok(Runtime {
            orchestrator: Arc::new(orchestrator),
            state,
            knowledge,
            durable,
            queue,
            pool,
            config: cfg,
        })
    }
}

/// 装配完成的运行时：编排器与需要由入口管理生命周期的部件
pub struct Runtime {
    pub orchestrator: Arc<Orchestrator>,
    pub state: Arc<StateStore>,
    pub knowledge: Arc<KnowledgeManager>,
    pub durable: Arc<dyn DurableStore>,
    pub queue: Arc<SyncQueue>,
    pub pool: SqlitePool,
    pub config: AppConfig,
}

impl Runtime {
    /// 新建一个共享同一队列的同步 worker（后台运行或手动触发批次）
    pub fn sync_worker(&self) -> SyncWorker {
        SyncWorker::new(self.queue.clone(), self.durable.clone(), &self.config.state)
    }

    pub fn spawn_sync_worker(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.sync_worker().spawn(cancel)
    }

    /// 清扫一次：淘汰过期热层会话，删除过期或版本已失效的知识库缓存
    pub async fn sweep(&self) -> SweepReport {
        let report = SweepReport {
            conversations: self.state.evict_expired().await,
            knowledge_keys: self.knowledge.purge_cache().await,
        };
        if report.conversations + report.knowledge_keys > 0 {
            tracing::debug!(
                conversations = report.conversations,
                knowledge_keys = report.knowledge_keys,
                "cache sweep"
            );
        }
        report
    }

    /// 按 `[state] sweep_interval_secs` 周期清扫，直到 cancel
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let runtime = Arc::clone(self);
        let period = Duration::from_secs(self.config.state.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval 的第一次 tick 立即返回
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        runtime.sweep().await;
                    }
                }
            }
            tracing::debug!("cache sweeper stopped");
        })
    }
}

/// 一次清扫的清理数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub conversations: usize,
    pub knowledge_keys: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use crate::llm::ScriptedLlm;

    #[tokio::test]
    async fn test_build_with_memory_pool() {
        let runtime = OrchestratorBuilder::new(AppConfig::default())
            .with_pool(memory_pool().await.unwrap())
            .with_llm(Arc::new(ScriptedLlm::default()))
            .build()
            .await
            .unwrap();
        assert!(runtime.queue.is_empty().await);
        assert_eq!(runtime.orchestrator.profiles().get(AgentType::Coder).agent, AgentType::Coder);
    }

    #[tokio::test]
    async fn test_sweep_releases_expired_and_superseded_entries() {
        let runtime = OrchestratorBuilder::new(AppConfig::default())
            .with_pool(memory_pool().await.unwrap())
            .with_llm(Arc::new(ScriptedLlm::default()))
            .build()
            .await
            .unwrap();
        for i in 0..20 {
            let state = crate::memory::ConversationState::new(format!("c{}", i), "u1", AgentType::Coder);
            runtime.state.save(&state, Some(Duration::ZERO)).await.unwrap();
        }
        for i in 0..5 {
            runtime
                .knowledge
                .add(crate::knowledge::NewKnowledgeEntry::new(
                    AgentType::Coder,
                    crate::agents::SourceType::Github,
                    "repos",
                    format!("r{}", i),
                    "v",
                ))
                .await
                .unwrap();
            runtime
                .knowledge
                .query(AgentType::Coder, &crate::knowledge::KnowledgeQuery::new())
                .await;
        }

        let report = runtime.sweep().await;
        assert_eq!(report.conversations, 20);
        assert_eq!(report.knowledge_keys, 4);
        assert_eq!(runtime.knowledge.cached_len().await, 1);
        assert_eq!(runtime.sweep().await, SweepReport::default());
    }

    #[tokio::test]
    async fn test_sweeper_runs_until_cancelled() {
        let mut cfg = AppConfig::default();
        cfg.state.sweep_interval_secs = 1;
        let runtime = Arc::new(
            OrchestratorBuilder::new(cfg)
                .with_pool(memory_pool().await.unwrap())
                .with_llm(Arc::new(ScriptedLlm::default()))
                .build()
                .await
                .unwrap(),
        );
        let state = crate::memory::ConversationState::new("c1", "u1", AgentType::Coder);
        runtime.state.save(&state, Some(Duration::ZERO)).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = runtime.spawn_sweeper(cancel.clone());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runtime.sweep().await.conversations, 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_default_agent_is_config_error() {
        let mut cfg = AppConfig::default();
        cfg.agents.default_agent = "astronaut".into();
        let err = OrchestratorBuilder::new(cfg)
            .with_pool(memory_pool().await.unwrap())
            .build()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
