//! TurnGate：同一会话的请求按到达顺序串行处理
//!
//! 每个会话一把 tokio Mutex（公平、FIFO）。表中只保存 Weak，会话空闲后锁自动释放。

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct TurnGate {
    locks: std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl TurnGate {
    pub fn new() -> Self {
        Self::default()
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

    /// 等待轮到该会话；返回的 guard 释放前同一会话的其他请求都在排队
    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(conversation_id).lock_owned().await
    }

    /// 当前仍被持有或等待的会话数
    pub fn active(&self) -> usize {
        match self.locks.lock() {
            Ok(locks) => locks.values().filter(|w| w.strong_count() > 0).count(),
            Err(poisoned) => poisoned
                .into_inner()
                .values()
                .filter(|w| w.strong_count() > 0)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_conversation_is_serialized_in_order() {
        let gate = Arc::new(TurnGate::new());
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let first = gate.acquire("c1").await;
        let mut handles = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _g = gate.acquire("c1").await;
                order.lock().await.push(i);
            }));
            // 保证按 0,1,2 的顺序排队
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(order.lock().await.is_empty());
        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_different_conversations_do_not_block() {
        let gate = TurnGate::new();
        let _a = gate.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), gate.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_idle_locks_are_released() {
        let gate = TurnGate::new();
        {
            let _g = gate.acquire("a").await;
            assert_eq!(gate.active(), 1);
        }
        assert_eq!(gate.active(), 0);
    }
}
