//! 升级判定：是否需要人工复核

use std::fmt;

use serde::Serialize;

use crate::memory::AgentMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationDecision {
    pub should_escalate: bool,
    pub reason: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy)]
pub struct EscalationDecider {
    threshold: u8,
}

impl EscalationDecider {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    /// 有问题项一律 critical；否则置信度低于阈值为 high
    pub fn decide(&self, confidence: u8, issues: &[String], _memory: &AgentMemory) -> EscalationDecision {
        if !issues.is_empty() {
            return EscalationDecision {
                should_escalate: true,
                reason: format!("Issues detected: {}", issues.join(", ")),
                severity: Severity::Critical,
            };
        }
        if confidence < self.threshold {
            return EscalationDecision {
                should_escalate: true,
                reason: format!("Confidence {}% is below threshold", confidence),
                severity: Severity::High,
            };
        }
        EscalationDecision {
            should_escalate: false,
            reason: "Quality passed".to_string(),
            severity: Severity::Low,
        }
    }
}

impl Default for EscalationDecider {
    fn default() -> Self {
        Self::new(70)
    }
}
