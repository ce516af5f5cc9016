//! 一轮请求的阶段
//!
//! Orchestrator 每推进一个阶段调用一次 [`TurnTrace::advance`]，阶段切换以 debug 级别记录。

use std::fmt;

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Init,
    StateLoaded,
    PromptBuilt,
    ToolsConnected,
    LlmCalled,
    ToolUseHandled,
    Verified,
    EscalationDecided,
    Persisted,
    Done,
}

impl TurnPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnPhase::Init => "init",
            TurnPhase::StateLoaded => "state_loaded",
            TurnPhase::PromptBuilt => "prompt_built",
            TurnPhase::ToolsConnected => "tools_connected",
            TurnPhase::LlmCalled => "llm_called",
            TurnPhase::ToolUseHandled => "tool_use_handled",
            TurnPhase::Verified => "verified",
            TurnPhase::EscalationDecided => "escalation_decided",
            TurnPhase::Persisted => "persisted",
            TurnPhase::Done => "done",
        }
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 记录一轮请求走过的阶段
#[derive(Clone, Debug)]
pub struct TurnTrace {
    conversation_id: String,
    phases: Vec<TurnPhase>,
}

impl TurnTrace {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            phases: vec![TurnPhase::Init],
        }
    }

    pub fn advance(&mut self, phase: TurnPhase) {
        tracing::debug!(conversation_id = %self.conversation_id, phase = %phase, "turn phase");
        self.phases.push(phase);
    }

    pub fn current(&self) -> TurnPhase {
        self.phases.last().copied().unwrap_or(TurnPhase::Init)
    }

    pub fn phases(&self) -> &[TurnPhase] {
        &self.phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_records_phases() {
        let mut trace = TurnTrace::new("c1");
        assert_eq!(trace.current(), TurnPhase::Init);
        trace.advance(TurnPhase::StateLoaded);
        trace.advance(TurnPhase::PromptBuilt);
        assert_eq!(trace.current(), TurnPhase::PromptBuilt);
        assert_eq!(trace.phases().len(), 3);
        assert_eq!(TurnPhase::ToolUseHandled.to_string(), "tool_use_handled");
    }
}
