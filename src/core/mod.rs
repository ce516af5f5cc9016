//! 核心编排层：请求主流程、阶段追踪、会话串行化、装配与关闭

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod prompt;
pub mod shutdown;
pub mod state;
pub mod turn_gate;

pub use builder::{OrchestratorBuilder, Runtime, SweepReport};
pub use error::AgentError;
pub use orchestrator::{
    AgentRequest, AgentResponse, Orchestrator, OrchestratorDeps, OrchestratorSettings,
    ResponseMetadata,
};
pub use shutdown::{
    run_with_graceful_shutdown, PoolCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, SyncFlushCleanup,
};
pub use state::{TurnPhase, TurnTrace};
pub use turn_gate::TurnGate;
