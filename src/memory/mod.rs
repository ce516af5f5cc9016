//! 记忆层：会话状态（短期）与按用户、Agent 的长期记忆

pub mod conversation;
pub mod learner;
pub mod long_term;
pub mod persistence;

pub use conversation::{
    AttachmentRef, ConversationMetadata, ConversationState, Message, MessageMeta, Role,
};
pub use learner::MemoryManager;
pub use long_term::{
    AgentMemory, InMemoryMemoryStore, Interaction, LearnedPattern, Lesson, LongTermMemory,
    MemoryError, MemoryStore, NoopLongTerm, Preferences,
};
pub use persistence::SqliteMemoryStore;
