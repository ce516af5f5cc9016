//! StateStore：编排器使用的会话状态入口
//!
//! 读写都走热层；save 同时把快照交给同步队列。append_message 在每会话锁内完成读-改-写。
//! save 在同一把锁内与热层现有状态合并：快照里缺少的已有消息会被保留，不会被整体覆盖。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::memory::{ConversationState, Message};
use crate::state::{
    ConversationStats, ConversationSummary, DurableStore, HotStore, StateError, SyncQueue,
};

/// 会话状态存储（热层 + 冷存储 + 同步队列）
pub struct StateStore {
    hot: Arc<dyn HotStore>,
    durable: Arc<dyn DurableStore>,
    queue: Arc<SyncQueue>,
    default_ttl: Duration,
    /// 每会话一把锁，保证同一会话的读-改-写不交错；只存 Weak，空闲会话不占表项
    locks: std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl StateStore {
    pub fn new(
        hot: Arc<dyn HotStore>,
        durable: Arc<dyn DurableStore>,
        queue: Arc<SyncQueue>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            hot,
            durable,
            queue,
            default_ttl,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    fn lock_for(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = locks.get(conversation_id).and_then(Weak::upgrade) {
            return existing;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(Mutex::new(()));
        locks.insert(conversation_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// 读热层；未命中不是错误
    pub async fn get(&self, conversation_id: &str) -> Result<Option<ConversationState>, StateError> {
        self.hot.get(conversation_id).await
    }

    /// 写热层并入队同步；不等待冷存储
    ///
    /// 快照读出之后由 append_message 追加的消息会合并进来，按时间排序。
    pub async fn save(&self, state: &ConversationState, ttl: Option<Duration>) -> Result<(), StateError> {
        let lock = self.lock_for(&state.conversation_id);
        let _guard = lock.lock().await;
        let mut merged = state.clone();
        if let Some(current) = self.hot.get(&state.conversation_id).await? {
            merge_missing(&mut merged, current);
        }
        self.save_locked(merged, ttl.unwrap_or(self.default_ttl)).await
    }

    async fn save_locked(&self, mut state: ConversationState, ttl: Duration) -> Result<(), StateError> {
        state.refresh_metadata();
        self.hot.set(&state, ttl).await?;
        self.queue.enqueue(state).await;
        Ok(())
    }

    /// 追加一条消息；会话不存在时不做任何事并返回 false
    pub async fn append_message(&self, conversation_id: &str, message: Message) -> Result<bool, StateError> {
        let lock = self.lock_for(conversation_id);
        let _guard = lock.lock().await;
        let Some(mut state) = self.hot.get(conversation_id).await? else {
            tracing::debug!(conversation_id, "append_message on missing state ignored");
            return Ok(false);
        };
        state.push(message);
        self.save_locked(state, self.default_ttl).await?;
        Ok(true)
    }

    /// 从冷存储重建会话并回填热层
    pub async fn recover(&self, conversation_id: &str) -> Result<Option<ConversationState>, StateError> {
        let state = match self.durable.load(conversation_id).await {
            Ok(Some(state)) => state,
            Ok(None) => return Ok(None),
            Err(e) => {
                tracing::warn!(conversation_id, "durable recovery failed: {}", e);
                return Ok(None);
            }
        };
        self.hot.set(&state, self.default_ttl).await?;
        tracing::info!(conversation_id, messages = state.messages.len(), "conversation recovered from durable store");
        Ok(Some(state))
    }

    /// 先读热层，未命中再从冷存储恢复
    pub async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>, StateError> {
        if let Some(state) = self.get(conversation_id).await? {
            return Ok(Some(state));
        }
        self.recover(conversation_id).await
    }

    pub async fn recent_conversations(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationSummary>, StateError> {
        self.durable.recent_conversations(user_id, limit).await
    }

    pub async fn conversation_stats(&self, conversation_id: &str) -> Result<Option<ConversationStats>, StateError> {
        self.durable.conversation_stats(conversation_id).await
    }

    /// 清理热层中已过期的会话（冷存储不受影响）
    pub async fn evict_expired(&self) -> usize {
        self.hot.evict_expired().await
    }

    pub async fn purge_older_than(&self, days: i64) -> Result<u64, StateError> {
        self.durable.purge_older_than(days).await
    }
}

/// 把热层里有、快照里没有的消息并入快照；context 中快照缺少的键一并保留
fn merge_missing(snapshot: &mut ConversationState, current: ConversationState) {
    let known: HashSet<(DateTime<Utc>, String)> = snapshot
        .messages
        .iter()
        .map(|m| (m.created_at, m.content.clone()))
        .collect();
    let missing: Vec<_> = current
        .messages
        .into_iter()
        .filter(|m| !known.contains(&(m.created_at, m.content.clone())))
        .collect();
    for (key, value) in current.context {
        snapshot.context.entry(key).or_insert(value);
    }
    snapshot.metadata.tokens_used = snapshot.metadata.tokens_used.max(current.metadata.tokens_used);
    if missing.is_empty() {
        return;
    }
    tracing::debug!(
        conversation_id = %snapshot.conversation_id,
        merged = missing.len(),
        "merging messages appended since snapshot was loaded"
    );
    snapshot.messages.extend(missing);
    snapshot.messages.sort_by_key(|m| m.created_at);
    snapshot.refresh_metadata();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentType;
    use crate::config::StateSection;
    use crate::db::memory_pool;
    use crate::state::{InMemoryHotStore, SqliteDurableStore, SyncWorker};

    struct Fixture {
        store: Arc<StateStore>,
        hot: Arc<InMemoryHotStore>,
        durable: Arc<SqliteDurableStore>,
        worker: SyncWorker,
    }

    async fn fixture() -> Fixture {
        let hot = Arc::new(InMemoryHotStore::new());
        let durable = Arc::new(SqliteDurableStore::new(memory_pool().await.unwrap()).await.unwrap());
        let queue = Arc::new(SyncQueue::new());
        let store = Arc::new(StateStore::new(
            hot.clone(),
            durable.clone(),
            queue.clone(),
            Duration::from_secs(3600),
        ));
        let worker = SyncWorker::new(queue, durable.clone(), &StateSection::default());
        Fixture {
            store,
            hot,
            durable,
            worker,
        }
    }

    #[tokio::test]
    async fn test_append_n_messages_in_order() {
        let f = fixture().await;
        let state = ConversationState::new("c1", "u1", AgentType::Coder);
        f.store.save(&state, None).await.unwrap();
        for i in 0..20 {
            assert!(f.store.append_message("c1", Message::user(format!("m{}", i))).await.unwrap());
        }
        let loaded = f.store.get("c1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 20);
        assert_eq!(loaded.metadata.message_count, 20);
        for (i, m) in loaded.messages.iter().enumerate() {
            assert_eq!(m.content, format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let f = fixture().await;
        f.store
            .save(&ConversationState::new("c1", "u1", AgentType::Coder), None)
            .await
            .unwrap();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = f.store.clone();
            handles.push(tokio::spawn(async move {
                store.append_message("c1", Message::user(format!("m{}", i))).await.unwrap()
            }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
        let loaded = f.store.get("c1").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 16);
        let times: Vec<_> = loaded.messages.iter().map(|m| m.created_at).collect();
        assert!(times.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_append_to_missing_state_is_noop() {
        let f = fixture().await;
        assert!(!f.store.append_message("nope", Message::user("hi")).await.unwrap());
        assert!(f.store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_double_sync_does_not_duplicate() {
        let f = fixture().await;
        let mut state = ConversationState::new("c1", "u1", AgentType::Coder);
        state.push(Message::user("a"));
        state.push(Message::assistant("b"));
        f.store.save(&state, None).await.unwrap();
        f.worker.process_batch(10).await;
        f.store.save(&state, None).await.unwrap();
        f.worker.process_batch(10).await;
        assert_eq!(f.durable.message_rows("c1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_append_during_open_snapshot_survives_save() {
        let f = fixture().await;
        f.store
            .save(&ConversationState::new("c1", "u1", AgentType::Coder), None)
            .await
            .unwrap();

        let mut snapshot = f.store.load("c1").await.unwrap().unwrap();
        assert!(f
            .store
            .append_message("c1", Message::user("concurrent append"))
            .await
            .unwrap());
        snapshot.push(Message::assistant("turn msg"));
        f.store.save(&snapshot, None).await.unwrap();

        let loaded = f.store.get("c1").await.unwrap().unwrap();
        let contents: Vec<_> = loaded.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["concurrent append", "turn msg"]);
        assert_eq!(loaded.metadata.message_count, 2);

        // 再次保存同一快照不会重复合并
        f.store.save(&loaded, None).await.unwrap();
        assert_eq!(f.store.get("c1").await.unwrap().unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_idle_conversation_locks_are_dropped() {
        let f = fixture().await;
        for i in 0..100 {
            let state = ConversationState::new(format!("c{}", i), "u1", AgentType::Coder);
            f.store.save(&state, None).await.unwrap();
        }
        let locks = f.store.locks.lock().unwrap();
        assert!(locks.len() <= 1);
        assert!(locks.values().all(|w| w.strong_count() == 0));
    }

    #[tokio::test]
    async fn test_recover_after_hot_eviction() {
        let f = fixture().await;
        let mut state = ConversationState::new("c1", "u1", AgentType::Design);
        state.push(Message::user("first"));
        state.push(Message::assistant("second"));
        f.store.save(&state, Some(Duration::ZERO)).await.unwrap();
        f.worker.process_batch(10).await;
        f.hot.evict_expired().await;

        assert!(f.store.get("c1").await.unwrap().is_none());
        let recovered = f.store.load("c1").await.unwrap().unwrap();
        assert_eq!(recovered.messages, state.messages);
        // 恢复后回填热层
        assert!(f.store.get("c1").await.unwrap().is_some());
        assert!(f.store.recover("never").await.unwrap().is_none());
    }
}
