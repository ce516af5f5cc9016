//! 回复质量校验与升级判定
//!
//! 所有扣分与阈值集中在 [`VerificationPolicy`]，对应配置文件的 `[verification]` 段。

pub mod checks;
pub mod escalation;
pub mod verifier;

use serde::{Deserialize, Serialize};

pub use checks::{structural_check, CheckOutcome};
pub use escalation::{EscalationDecider, EscalationDecision, Severity};
pub use verifier::{VerificationResult, Verifier};

/// [verification] 段：扣分项与升级阈值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationPolicy {
    /// 置信度低于该值即升级人工
    pub escalation_threshold: u8,
    /// 只校验置信度高于该值的习得模式
    pub pattern_min_confidence: f32,
    /// 模式关键词在回复中的最低覆盖率
    pub pattern_min_overlap: f32,
    pub pattern_penalty: i32,
    pub rule_penalty: i32,
    pub rule_check_max_tokens: u32,
    pub coder_error_handling_penalty: i32,
    pub coder_comment_penalty: i32,
    pub coder_min_comment_ratio: f32,
    pub analyst_source_penalty: i32,
    pub marketing_cta_penalty: i32,
    pub marketing_hyperbole_penalty: i32,
    pub design_accessibility_penalty: i32,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self {
            escalation_threshold: 70,
            pattern_min_confidence: 0.8,
            pattern_min_overlap: 0.5,
            pattern_penalty: 10,
            rule_penalty: 15,
            rule_check_max_tokens: 50,
            coder_error_handling_penalty: 10,
            coder_comment_penalty: 5,
            coder_min_comment_ratio: 0.1,
            analyst_source_penalty: 20,
            marketing_cta_penalty: 15,
            marketing_hyperbole_penalty: 10,
            design_accessibility_penalty: 10,
        }
    }
}
