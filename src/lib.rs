//! Squad - 多 Agent 编排引擎
//!
//! 模块划分：
//! - **agents**: 四个专职 Agent 的画像、授权表与路由
//! - **attachments**: 附件引用的水合（交给 LLM 前）
//! - **cache**: 带 TTL 的内存缓存
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排主流程、阶段追踪、会话串行化、装配与关闭
//! - **db**: SQLite 连接池
//! - **knowledge**: 按数据源权限隔离的知识库
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 会话消息与长期记忆（偏好、模式、规则）
//! - **state**: 会话状态热层、冷存储与同步
//! - **tools**: 工具会话、stdio JSON-RPC 桥接与调用器
//! - **verification**: 回复校验与升级判定

pub mod agents;
pub mod attachments;
pub mod cache;
pub mod config;
pub mod core;
pub mod db;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod state;
pub mod tools;
pub mod verification;

pub use crate::core::{AgentError, AgentRequest, AgentResponse, Orchestrator, OrchestratorBuilder};
