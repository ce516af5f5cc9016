//! 会话状态：消息序列、工作上下文与统计
//!
//! 消息只追加不修改；同一会话内时间戳严格递增（冷存储去重键依赖于此）。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agents::AgentType;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// 附件引用：只保存元数据与地址，不保存内容
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl AttachmentRef {
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            filename: filename.into(),
            mime_type: mime_type.into(),
            size,
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// 去掉内联的 data: URL（base64 内容不进入状态存储）
    pub fn sanitized(mut self) -> Self {
        if self.url.as_deref().map(|u| u.starts_with("data:")).unwrap_or(false) {
            self.url = None;
        }
        self
    }
}

/// 助手消息附带的校验信息
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_used: Option<String>,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MessageMeta>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            attachments: Vec::new(),
            meta: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::with_role(Role::Tool, content)
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments.into_iter().map(AttachmentRef::sanitized).collect();
        self
    }

    pub fn with_meta(mut self, meta: MessageMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// 会话统计
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: usize,
    #[serde(default)]
    pub tokens_used: u64,
}

/// 一个会话的完整状态
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub conversation_id: String,
    pub user_id: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub messages: Vec<Message>,
    /// 工具输出与工作数据，按工具名存放
    #[serde(default)]
    pub context: Map<String, Value>,
    pub metadata: ConversationMetadata,
}

impl ConversationState {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        agent_type: AgentType,
    ) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            agent_type,
            messages: Vec::new(),
            context: Map::new(),
            metadata: ConversationMetadata {
                started_at: now,
                last_message_at: now,
                message_count: 0,
                tokens_used: 0,
            },
        }
    }

    /// 追加消息；时间戳不晚于上一条时向后推 1 微秒
    pub fn push(&mut self, mut msg: Message) {
        if let Some(last) = self.messages.last() {
            if msg.created_at <= last.created_at {
                msg.created_at = last.created_at + Duration::microseconds(1);
            }
        }
        self.messages.push(msg);
        self.refresh_metadata();
    }

    /// 依据消息序列刷新 last_message_at / message_count
    pub fn refresh_metadata(&mut self) {
        self.metadata.message_count = self.messages.len();
        if let Some(last) = self.messages.last() {
            self.metadata.last_message_at = last.created_at;
        }
    }

    /// 最近 n 条消息
    pub fn recent(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_keeps_order_and_monotonic_time() {
        let mut state = ConversationState::new("c1", "u1", AgentType::Coder);
        let t = Utc::now();
        state.push(Message::user("a").at(t));
        state.push(Message::assistant("b").at(t));
        state.push(Message::user("c").at(t - Duration::seconds(5)));
        assert_eq!(state.len(), 3);
        assert_eq!(state.metadata.message_count, 3);
        let contents: Vec<_> = state.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
        assert!(state.messages[0].created_at < state.messages[1].created_at);
        assert!(state.messages[1].created_at < state.messages[2].created_at);
        assert_eq!(state.metadata.last_message_at, state.messages[2].created_at);
    }

    #[test]
    fn test_recent_window() {
        let mut state = ConversationState::new("c1", "u1", AgentType::Coder);
        for i in 0..15 {
            state.push(Message::user(format!("m{}", i)));
        }
        let recent = state.recent(10);
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].content, "m5");
        assert_eq!(state.recent(100).len(), 15);
    }

    #[test]
    fn test_inline_attachment_payload_is_stripped() {
        let att = AttachmentRef::new("a", "x.png", "image/png", 3).with_url("data:image/png;base64,AAA");
        let msg = Message::user("look").with_attachments(vec![att]);
        assert_eq!(msg.attachments[0].url, None);

        let att = AttachmentRef::new("b", "y.png", "image/png", 3).with_url("https://cdn/x.png");
        let msg = Message::user("look").with_attachments(vec![att]);
        assert_eq!(msg.attachments[0].url.as_deref(), Some("https://cdn/x.png"));
    }

    #[test]
    fn test_serde_shape() {
        let state = ConversationState::new("c1", "u1", AgentType::Analyst);
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["conversationId"], "c1");
        assert_eq!(v["agentType"], "analyst");
        let back: ConversationState = serde_json::from_value(v).unwrap();
        assert_eq!(back, state);
    }
}
