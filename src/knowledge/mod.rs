//! 知识库：按 Agent 与数据源权限隔离的参考资料

pub mod entry;
pub mod manager;
pub mod repository;

pub use entry::{
    EntryFilter, KnowledgeEntry, KnowledgeError, KnowledgeQuery, KnowledgeStats, NewKnowledgeEntry,
};
pub use manager::KnowledgeManager;
pub use repository::{KnowledgeRepository, SqliteKnowledgeRepository};
