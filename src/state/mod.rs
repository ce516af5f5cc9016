//! 会话状态分层存储
//!
//! - **hot**: 带 TTL 的热层（每轮读写，失败即本轮失败）
//! - **durable**: SQLite 冷存储（按内容 + 时间戳幂等写入）
//! - **sync**: 热层到冷存储的异步同步队列与后台 worker
//! - **store**: 对编排器暴露的 StateStore（get / save / append_message / recover）

pub mod durable;
pub mod hot;
pub mod store;
pub mod sync;

use thiserror::Error;

pub use durable::{ConversationStats, ConversationSummary, DurableStore, SqliteDurableStore};
pub use hot::{HotStore, InMemoryHotStore};
pub use store::StateStore;
pub use sync::{SyncQueue, SyncReport, SyncWorker};

/// 状态层错误
#[derive(Error, Debug)]
pub enum StateError {
    /// 热层不可用：本轮请求失败，可重试
    #[error("Hot state store unavailable: {0}")]
    Hot(String),

    /// 冷存储失败：由同步 worker 记录并重试
    #[error("Durable store error: {0}")]
    Durable(#[from] sqlx::Error),

    #[error("State encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Corrupt durable row: {0}")]
    Corrupt(String),
}

impl StateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::Hot(_) | StateError::Durable(_))
    }
}
