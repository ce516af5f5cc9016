//! Agent 画像与路由
//!
//! - **profile**: 四个专职 Agent 的静态画像（授权表、视觉能力、工具上限、阈值）
//! - **detect**: 根据附件或 LLM 分类决定由哪个 Agent 处理

pub mod detect;
pub mod profile;

pub use detect::{detect_from_attachments, detect_from_filename, route_with_llm};
pub use profile::{
    AgentProfile, AgentProfiles, AgentType, AttachmentRejection, Authority, DataSource, SourceType,
    VisionCapabilities,
};
