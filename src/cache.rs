//! 带过期时间的内存缓存
//!
//! 热层会话状态与知识库查询共用：按 key 存放克隆值，读取时惰性淘汰过期项。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct CachedValue<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CachedValue<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// 以 String 为 key 的 TTL 缓存（并发安全）
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, CachedValue<V>>>,
}

impl<V: Clone + Send + Sync> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 读取未过期的值；过期项在此处移除
    pub async fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(c) if !c.is_expired(now) => return Some(c.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        let mut entries = self.entries.write().await;
        if entries.get(key).map(|c| c.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }
        None
    }

    /// 写入并重置过期时间
    pub async fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.into(), CachedValue { value, expires_at });
    }

    pub async fn remove(&self, key: &str) -> Option<V> {
        self.entries.write().await.remove(key).map(|c| c.value)
    }

    /// 清理所有过期项，返回清理条数
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, c| !c.is_expired(now));
        before - entries.len()
    }

    /// 只保留 key 满足条件的项，返回删除条数
    pub async fn retain_keys(&self, keep: impl Fn(&str) -> bool) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| keep(key));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_and_set() {
        let cache = TtlCache::new();
        cache.set("a", 1u32, Duration::from_secs(60)).await;
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("b").await, None);
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let cache = TtlCache::new();
        cache.set("a", "v".to_string(), Duration::ZERO).await;
        assert_eq!(cache.get("a").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let cache = TtlCache::new();
        cache.set("keep", 1, Duration::from_secs(60)).await;
        cache.set("drop", 2, Duration::ZERO).await;
        assert_eq!(cache.purge_expired().await, 1);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.remove("keep").await, Some(1));
    }

    #[tokio::test]
    async fn test_retain_keys() {
        let cache = TtlCache::new();
        cache.set("kb:coder:v1:a", 1, Duration::from_secs(60)).await;
        cache.set("kb:coder:v2:a", 2, Duration::from_secs(60)).await;
        assert_eq!(cache.retain_keys(|k| k.starts_with("kb:coder:v2:")).await, 1);
        assert_eq!(cache.get("kb:coder:v2:a").await, Some(2));
        assert_eq!(cache.len().await, 1);
    }
}
