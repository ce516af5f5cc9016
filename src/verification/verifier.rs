//! Verifier：回复发出前的质量校验
//!
//! 置信度从 100 开始：习得模式未覆盖扣分，结构检查取较小值，用户规则由 LLM 逐条判定。
//! 结果最终截断到 [0, 100]。

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::agents::AgentType;
use crate::llm::LlmClient;
use crate::memory::AgentMemory;
use crate::verification::{structural_check, VerificationPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub passed: bool,
    pub confidence: u8,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub should_escalate: bool,
}

pub struct Verifier {
    llm: Arc<dyn LlmClient>,
    policy: VerificationPolicy,
}

impl Verifier {
    pub fn new(llm: Arc<dyn LlmClient>, policy: VerificationPolicy) -> Self {
        Self { llm, policy }
    }

    pub fn policy(&self) -> &VerificationPolicy {
        &self.policy
    }

    pub async fn verify(
        &self,
        agent: AgentType,
        response: &str,
        context: &Map<String, Value>,
        memory: &AgentMemory,
    ) -> VerificationResult {
        let mut confidence: i32 = 100;
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        for pattern in memory
            .patterns
            .iter()
            .filter(|p| p.confidence > self.policy.pattern_min_confidence)
        {
            if !follows_pattern(response, &pattern.pattern, self.policy.pattern_min_overlap) {
                warnings.push(format!("May not follow pattern: {}", pattern.pattern));
                confidence -= self.policy.pattern_penalty;
            }
        }

        let structural = structural_check(agent, response, context, &self.policy);
        issues.extend(structural.issues);
        warnings.extend(structural.warnings);
        confidence = confidence.min(structural.confidence);

        for rule in &memory.verification_rules {
            match self.check_rule(response, rule).await {
                Ok(true) => {}
                Ok(false) => {
                    issues.push(format!("Failed rule: {}", rule));
                    confidence -= self.policy.rule_penalty;
                }
                Err(e) => {
                    tracing::warn!(agent = %agent, rule = %rule, "rule check failed: {}", e);
                    warnings.push(format!("Could not check rule: {}", rule));
                }
            }
        }

        let confidence = confidence.clamp(0, 100) as u8;
        let passed = confidence >= self.policy.escalation_threshold && issues.is_empty();
        tracing::debug!(agent = %agent, confidence, issues = issues.len(), warnings = warnings.len(), "response verified");

        VerificationResult {
            passed,
            confidence,
            issues,
            warnings,
            should_escalate: !passed,
        }
    }

    async fn check_rule(&self, response: &str, rule: &str) -> Result<bool, crate::llm::LlmError> {
        let prompt = format!(
            "Does this response follow the rule: \"{}\"?\n\nResponse: \"{}\"\n\nAnswer: yes or no only",
            rule, response
        );
        let answer = self.llm.ask(&prompt, self.policy.rule_check_max_tokens).await?;
        Ok(answer.to_lowercase().contains("yes"))
    }
}

/// 模式关键词在回复中出现的比例不低于 min_overlap
fn follows_pattern(response: &str, pattern: &str, min_overlap: f32) -> bool {
    let keywords: Vec<String> = pattern.split_whitespace().map(str::to_lowercase).collect();
    if keywords.is_empty() {
        return true;
    }
    let lower = response.to_lowercase();
    let matched = keywords.iter().filter(|k| lower.contains(k.as_str())).count();
    matched as f32 / keywords.len() as f32 >= min_overlap
}
