//! 热层：按会话 id 存放完整状态，超过 TTL 后淘汰（冷存储仍保留）

use std::time::Duration;

use async_trait::async_trait;

use crate::cache::TtlCache;
use crate::memory::ConversationState;
use crate::state::StateError;

/// 热层存储接口（内存实现；可替换为 Redis 等外部缓存）
#[async_trait]
pub trait HotStore: Send + Sync {
    /// 未命中返回 Ok(None)
    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationState>, StateError>;

    async fn set(&self, state: &ConversationState, ttl: Duration) -> Result<(), StateError>;

    async fn delete(&self, conversation_id: &str) -> Result<(), StateError>;

    /// 清理过期会话，返回清理数量；自带过期机制的外部缓存不需要实现
    async fn evict_expired(&self) -> usize {
        0
    }
}

fn key(conversation_id: &str) -> String {
    format!("conv:{}", conversation_id)
}

/// 进程内热层
#[derive(Default)]
pub struct InMemoryHotStore {
    cache: TtlCache<ConversationState>,
}

impl InMemoryHotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HotStore for InMemoryHotStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<ConversationState>, StateError> {
        Ok(self.cache.get(&key(conversation_id)).await)
    }

    async fn set(&self, state: &ConversationState, ttl: Duration) -> Result<(), StateError> {
        self.cache
            .set(key(&state.conversation_id), state.clone(), ttl)
            .await;
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> Result<(), StateError> {
        self.cache.remove(&key(conversation_id)).await;
        Ok(())
    }

    async fn evict_expired(&self) -> usize {
        self.cache.purge_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentType;

    #[tokio::test]
    async fn test_set_get_expire() {
        let hot = InMemoryHotStore::new();
        let state = ConversationState::new("c1", "u1", AgentType::Coder);
        hot.set(&state, Duration::from_secs(60)).await.unwrap();
        assert_eq!(hot.get("c1").await.unwrap(), Some(state.clone()));
        assert_eq!(hot.get("c2").await.unwrap(), None);

        hot.set(&state, Duration::ZERO).await.unwrap();
        assert_eq!(hot.get("c1").await.unwrap(), None);

        hot.set(&state, Duration::from_secs(60)).await.unwrap();
        hot.delete("c1").await.unwrap();
        assert_eq!(hot.get("c1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_evict_expired_drops_unread_states() {
        let hot = InMemoryHotStore::new();
        for i in 0..5 {
            let state = ConversationState::new(format!("c{}", i), "u1", AgentType::Coder);
            hot.set(&state, Duration::ZERO).await.unwrap();
        }
        hot.set(&ConversationState::new("live", "u1", AgentType::Coder), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(hot.evict_expired().await, 5);
        assert_eq!(hot.cache.len().await, 1);
        assert!(hot.get("live").await.unwrap().is_some());
    }
}
