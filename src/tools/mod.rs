//! 工具桥接：会话抽象、stdio JSON-RPC 服务器、进程内注册表与带超时/限流的调用器

pub mod bridge;
pub mod executor;
pub mod registry;
pub mod stdio;

pub use bridge::{NoTools, ToolBridge, ToolCallOutcome, ToolError, ToolSession, ToolSpec};
pub use executor::ToolInvoker;
pub use registry::{LocalToolBridge, Tool, ToolRegistry};
pub use stdio::{StdioToolBridge, StdioToolSession};
