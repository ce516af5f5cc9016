//! Orchestrator：一轮请求的主流程
//!
//! 解析 Agent → 加载状态与长期记忆 → 组装提示词 → 连接工具 → 调用 LLM（最多 max_attempts 次，
//! 每次至多一次工具调用）→ 校验 → 升级判定 → 持久化 → 异步学习。
//!
//! 同一会话的请求由 [`TurnGate`] 串行化；取消时不写入任何状态。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agents::{detect_from_attachments, route_with_llm, AgentProfile, AgentProfiles, AgentType};
use crate::attachments::{describe, AttachmentResolver};
use crate::core::prompt::{build_system_prompt, revision_notes};
use crate::core::{AgentError, TurnGate, TurnPhase, TurnTrace};
use crate::knowledge::KnowledgeManager;
use crate::llm::{ChatMessage, CompletionOutput, CompletionRequest, LlmClient};
use crate::memory::{
    AgentMemory, AttachmentRef, ConversationState, Interaction, LongTermMemory, Message,
    MessageMeta, Role,
};
use crate::state::StateStore;
use crate::tools::{ToolBridge, ToolCallOutcome, ToolInvoker, ToolSession, ToolSpec};
use crate::verification::{EscalationDecider, Severity, VerificationResult, Verifier};

/// 一次用户请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub conversation_id: String,
    pub user_id: String,
    /// 未指定时由附件文件名、LLM 路由或默认值决定
    #[serde(default)]
    pub agent_type: Option<AgentType>,
    #[serde(alias = "userMessage")]
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl AgentRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            agent_type: None,
            message: message.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_agent(mut self, agent: AgentType) -> Self {
        self.agent_type = Some(agent);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    /// 会话累计 token
    pub tokens_used: u64,
    pub processing_time_ms: u64,
    pub retry_count: u32,
    pub agent_type: AgentType,
}

/// 一轮请求的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub message: String,
    pub confidence: u8,
    pub verified: bool,
    pub escalated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation_reason: Option<String>,
    pub severity: Severity,
    pub warnings: Vec<String>,
    pub metadata: ResponseMetadata,
}

/// 编排参数（来自 [app] / [llm] / [agents] / [tools]）
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub context_window: usize,
    pub max_attempts: u32,
    pub max_tokens: u32,
    pub default_agent: AgentType,
    pub auto_route: bool,
    pub tool_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            context_window: 10,
            max_attempts: 2,
            max_tokens: 4096,
            default_agent: AgentType::Coder,
            auto_route: false,
            tool_timeout: Duration::from_secs(30),
        }
    }
}

/// Orchestrator 依赖的全部协作者
pub struct OrchestratorDeps {
    pub profiles: Arc<AgentProfiles>,
    pub state: Arc<StateStore>,
    pub knowledge: Arc<KnowledgeManager>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolBridge>,
    pub memory: Arc<dyn LongTermMemory>,
    pub attachments: Arc<dyn AttachmentResolver>,
    pub verifier: Verifier,
    pub decider: EscalationDecider,
}

/// 一次尝试的产出
struct Draft {
    text: String,
    verification: VerificationResult,
    tool_used: Option<String>,
}

struct LoopOutcome {
    draft: Draft,
    tokens: u64,
    retry_count: u32,
}

pub struct Orchestrator {
    deps: OrchestratorDeps,
    settings: OrchestratorSettings,
    invokers: HashMap<AgentType, ToolInvoker>,
    gate: TurnGate,
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, AgentError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AgentError::Cancelled),
        out = fut => Ok(out),
    }
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, settings: OrchestratorSettings) -> Self {
        let invokers = AgentType::ALL
            .into_iter()
            .map(|agent| {
                let limit = deps.profiles.get(agent).tool_limit;
                (agent, ToolInvoker::new(agent, limit, settings.tool_timeout))
            })
            .collect();
        Self {
            deps,
            settings,
            invokers,
            gate: TurnGate::new(),
        }
    }

    pub fn profiles(&self) -> &AgentProfiles {
        &self.deps.profiles
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.deps.state
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeManager> {
        &self.deps.knowledge
    }

    /// 处理一轮请求
    pub async fn process(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        let started = Instant::now();
        let mut trace = TurnTrace::new(&request.conversation_id);
        let _turn = cancellable(&cancel, self.gate.acquire(&request.conversation_id)).await?;

        let agent = self.resolve_agent(&request).await;
        let profile = self.deps.profiles.get(agent);
        let mut warnings = Vec::new();
        let attachments = accept_attachments(profile, &request.attachments, &mut warnings);

        let mut state = match self.deps.state.load(&request.conversation_id).await? {
            Some(state) => state,
            None => ConversationState::new(&request.conversation_id, &request.user_id, agent),
        };
        state.agent_type = agent;
        let memory = match self.deps.memory.get(&request.user_id, agent).await {
            Ok(memory) => memory,
            Err(e) => {
                tracing::warn!(user_id = %request.user_id, agent = %agent, "long-term memory unavailable: {}", e);
                AgentMemory::new(&request.user_id, agent)
            }
        };
        trace.advance(TurnPhase::StateLoaded);

        let mut history = Vec::new();
        for m in history_window(&state, self.settings.context_window) {
            history.push(self.chat_message(m.role, &m.content, &m.attachments).await);
        }
        state.push(Message::user(&request.message).with_attachments(attachments.clone()));

        let knowledge = self.deps.knowledge.build_context(agent, None).await;
        let system_prompt = build_system_prompt(profile, &knowledge, &memory);
        trace.advance(TurnPhase::PromptBuilt);

        let (session, specs) = self.connect_tools(agent, &cancel).await?;
        trace.advance(TurnPhase::ToolsConnected);

        let user_turn = self.chat_message(Role::User, &request.message, &attachments).await;
        let mut messages = history;
        messages.push(user_turn);

        let result = self
            .run_attempts(
                agent,
                &system_prompt,
                messages,
                &specs,
                session.as_deref(),
                &mut state,
                &memory,
                &cancel,
                &mut trace,
            )
            .await;
        if let Some(session) = &session {
            session.close().await;
        }
        let outcome = result?;
        let Draft {
            text,
            verification,
            tool_used,
        } = outcome.draft;

        let decision = self
            .deps
            .decider
            .decide(verification.confidence, &verification.issues, &memory);
        trace.advance(TurnPhase::EscalationDecided);

        warnings.extend(verification.warnings.iter().cloned());
        let meta = MessageMeta {
            confidence: Some(verification.confidence),
            verified: verification.passed,
            warnings: warnings.clone(),
            agent_type: Some(agent),
            tool_used,
        };
        state.push(Message::assistant(&text).with_meta(meta));
        state.metadata.tokens_used += outcome.tokens;
        self.deps.state.save(&state, None).await?;
        trace.advance(TurnPhase::Persisted);

        self.spawn_learning(
            &request.user_id,
            agent,
            Interaction {
                user_message: request.message.clone(),
                assistant_response: text.clone(),
                was_approved: !decision.should_escalate,
                confidence: verification.confidence,
            },
        );

        trace.advance(TurnPhase::Done);
        tracing::info!(
            conversation_id = %request.conversation_id,
            agent = %agent,
            confidence = verification.confidence,
            escalated = decision.should_escalate,
            retries = outcome.retry_count,
            "turn completed"
        );

        Ok(AgentResponse {
            message: text,
            confidence: verification.confidence,
            verified: verification.passed,
            escalated: decision.should_escalate,
            escalation_reason: decision.should_escalate.then_some(decision.reason),
            severity: decision.severity,
            warnings,
            metadata: ResponseMetadata {
                tokens_used: state.metadata.tokens_used,
                processing_time_ms: started.elapsed().as_millis() as u64,
                retry_count: outcome.retry_count,
                agent_type: agent,
            },
        })
    }

    /// 显式指定 > 附件文件名 > LLM 路由（可选）> 默认
    async fn resolve_agent(&self, request: &AgentRequest) -> AgentType {
        if let Some(agent) = request.agent_type {
            return agent;
        }
        if let Some(agent) = detect_from_attachments(&request.attachments) {
            tracing::debug!(agent = %agent, "agent inferred from attachments");
            return agent;
        }
        if self.settings.auto_route {
            if let Some(agent) = route_with_llm(self.deps.llm.as_ref(), &request.message).await {
                tracing::debug!(agent = %agent, "agent chosen by router");
                return agent;
            }
        }
        self.settings.default_agent
    }

    async fn connect_tools(
        &self,
        agent: AgentType,
        cancel: &CancellationToken,
    ) -> Result<(Option<Arc<dyn ToolSession>>, Vec<ToolSpec>), AgentError> {
        let session = match cancellable(cancel, self.deps.tools.connect(agent)).await? {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(agent = %agent, "tool connection failed, running without tools: {}", e);
                return Ok((None, Vec::new()));
            }
        };
        match cancellable(cancel, session.list_tools()).await {
            Ok(Ok(specs)) => Ok((Some(session), specs)),
            Ok(Err(e)) => {
                tracing::warn!(agent = %agent, "listing tools failed, running without tools: {}", e);
                session.close().await;
                Ok((None, Vec::new()))
            }
            Err(cancelled) => {
                session.close().await;
                Err(cancelled)
            }
        }
    }

    /// 送给 LLM 的一条消息（本轮或历史）：可水合的附件以图片形式附上，其余以文字描述附在正文后
    async fn chat_message(&self, role: Role, text: &str, attachments: &[AttachmentRef]) -> ChatMessage {
        let mut hydrated = Vec::new();
        let mut described = Vec::new();
        for attachment in attachments {
            match self.deps.attachments.hydrate(attachment).await {
                Some(h) => hydrated.push(h),
                None => described.push(attachment.clone()),
            }
        }
        let content = if described.is_empty() {
            text.to_string()
        } else {
            format!("{}\n\n{}", text, describe(&described))
        };
        ChatMessage::new(role, content).with_attachments(hydrated)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempts(
        &self,
        agent: AgentType,
        system_prompt: &str,
        messages: Vec<ChatMessage>,
        specs: &[ToolSpec],
        session: Option<&dyn ToolSession>,
        state: &mut ConversationState,
        memory: &AgentMemory,
        cancel: &CancellationToken,
        trace: &mut TurnTrace,
    ) -> Result<LoopOutcome, AgentError> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut tokens = 0u64;
        let mut retry_count = 0u32;
        let mut previous: Option<VerificationResult> = None;

        loop {
            let system = match &previous {
                Some(prev) => format!("{}{}", system_prompt, revision_notes(prev)),
                None => system_prompt.to_string(),
            };
            let request = CompletionRequest::new(system, messages.clone())
                .with_tools(specs.to_vec())
                .with_max_tokens(self.settings.max_tokens);

            let completion = cancellable(cancel, self.deps.llm.complete(&request)).await??;
            tokens += completion.usage.total();
            trace.advance(TurnPhase::LlmCalled);

            let (text, tool_used) = match completion.output {
                CompletionOutput::Text(text) => (text, None),
                CompletionOutput::ToolUse(tool_use) => {
                    let outcome = match session {
                        Some(session) => {
                            let invoker = &self.invokers[&agent];
                            cancellable(
                                cancel,
                                invoker.call(session, &tool_use.name, tool_use.args.clone()),
                            )
                            .await?
                        }
                        None => ToolCallOutcome::Error("no tool session available".to_string()),
                    };
                    state.context.insert(tool_use.name.clone(), outcome.to_json());
                    let feedback = outcome.feedback(&tool_use.name);
                    let resumed = cancellable(
                        cancel,
                        self.deps.llm.resume_after_tool(&request, &tool_use, &feedback),
                    )
                    .await??;
                    tokens += resumed.usage.total();
                    trace.advance(TurnPhase::ToolUseHandled);

                    let text = match resumed.output {
                        CompletionOutput::Text(text) => text,
                        CompletionOutput::ToolUse(next) => {
                            tracing::warn!(agent = %agent, tool = %next.name, "second tool call in one attempt ignored");
                            let preview: String = feedback.chars().take(100).collect();
                            format!("Used tool {}. Result: {}", tool_use.name, preview)
                        }
                    };
                    (text, Some(tool_use.name))
                }
            };

            let verification = self
                .deps
                .verifier
                .verify(agent, &text, &state.context, memory)
                .await;
            trace.advance(TurnPhase::Verified);

            let attempts_made = retry_count + 1;
            if verification.passed || attempts_made >= max_attempts {
                return Ok(LoopOutcome {
                    draft: Draft {
                        text,
                        verification,
                        tool_used,
                    },
                    tokens,
                    retry_count,
                });
            }
            tracing::debug!(
                agent = %agent,
                confidence = verification.confidence,
                issues = verification.issues.len(),
                "draft failed verification, retrying"
            );
            retry_count += 1;
            previous = Some(verification);
        }
    }

    fn spawn_learning(&self, user_id: &str, agent: AgentType, interaction: Interaction) {
        let memory = self.deps.memory.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = memory.record_interaction(&user_id, agent, interaction).await {
                tracing::warn!(user_id = %user_id, agent = %agent, "learning from interaction failed: {}", e);
            }
        });
    }
}

/// 校验附件；不支持的附件丢弃并在回复中给出提示
fn accept_attachments(
    profile: &AgentProfile,
    attachments: &[AttachmentRef],
    warnings: &mut Vec<String>,
) -> Vec<AttachmentRef> {
    let mut accepted = Vec::new();
    for attachment in attachments {
        match profile.validate_attachment(&attachment.mime_type, attachment.size) {
            Ok(()) => accepted.push(attachment.clone()),
            Err(rejection) => {
                tracing::warn!(agent = %profile.agent, file = %attachment.filename, "attachment rejected");
                warnings.push(profile.rejection_message(&attachment.filename, &rejection));
            }
        }
    }
    accepted
}

/// 本轮之前的最近若干条 user / assistant 消息
fn history_window(state: &ConversationState, window: usize) -> Vec<&Message> {
    let turns: Vec<&Message> = state
        .messages
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .collect();
    turns[turns.len().saturating_sub(window)..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::AgentProfiles;

    #[test]
    fn test_history_window_skips_tool_messages() {
        let mut state = ConversationState::new("c", "u", AgentType::Coder);
        for i in 0..6 {
            state.push(Message::user(format!("q{}", i)));
            state.push(Message::tool("raw tool output"));
            state.push(Message::assistant(format!("a{}", i)));
        }
        let history = history_window(&state, 4);
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q4", "a4", "q5", "a5"]);
        assert_eq!(history_window(&state, 100).len(), 12);
        assert!(history_window(&state, 0).is_empty());
    }

    #[test]
    fn test_rejected_attachment_becomes_warning() {
        let profiles = AgentProfiles::builtin();
        let mut warnings = Vec::new();
        let accepted = accept_attachments(
            profiles.get(AgentType::Design),
            &[
                AttachmentRef::new("a1", "mock.png", "image/png", 1024),
                AttachmentRef::new("a2", "huge.png", "image/png", 50 * 1024 * 1024),
            ],
            &mut warnings,
        );
        assert_eq!(accepted.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("huge.png"));
    }

    #[test]
    fn test_request_accepts_user_message_alias() {
        let json = r#"{"conversationId":"c","userId":"u","agentType":"analyst","userMessage":"hi"}"#;
        let req: AgentRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.agent_type, Some(AgentType::Analyst));
        assert_eq!(req.message, "hi");
        assert!(req.attachments.is_empty());
    }
}
