//! 各 Agent 的结构检查（纯文本规则，不调用 LLM）

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::agents::AgentType;
use crate::verification::VerificationPolicy;

const CTA_KEYWORDS: [&str; 5] = ["click", "learn more", "sign up", "get started", "contact"];
const HYPERBOLE_WORDS: [&str; 5] = ["best", "perfect", "guaranteed", "always", "never"];

/// 单项检查结果；confidence 从 100 起扣
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub confidence: i32,
}

impl Default for CheckOutcome {
    fn default() -> Self {
        Self {
            issues: Vec::new(),
            warnings: Vec::new(),
            confidence: 100,
        }
    }
}

impl CheckOutcome {
    fn warn(&mut self, message: &str, penalty: i32) {
        self.warnings.push(message.to_string());
        self.confidence -= penalty;
    }

    fn issue(&mut self, message: &str, penalty: i32) {
        self.issues.push(message.to_string());
        self.confidence -= penalty;
    }
}

fn has_digits(text: &str) -> bool {
    static DIGITS: OnceLock<Option<Regex>> = OnceLock::new();
    match DIGITS.get_or_init(|| Regex::new(r"\d").ok()) {
        Some(re) => re.is_match(text),
        None => text.chars().any(|c| c.is_ascii_digit()),
    }
}

fn check_code(response: &str, policy: &VerificationPolicy) -> CheckOutcome {
    let mut out = CheckOutcome::default();

    if !response.contains("try") && !response.contains("catch") {
        out.warn("No error handling detected", policy.coder_error_handling_penalty);
    }

    let lines = response.split('\n').count().max(1);
    let comments = response.matches("//").count();
    if (comments as f32 / lines as f32) < policy.coder_min_comment_ratio {
        out.warn("Code may need more comments", policy.coder_comment_penalty);
    }

    if response.matches("any").count() > 2 {
        out.warn("Too many \"any\" types - consider specific types", 0);
    }
    out
}

fn check_design(response: &str, context: &Map<String, Value>, policy: &VerificationPolicy) -> CheckOutcome {
    let mut out = CheckOutcome::default();
    let lower = response.to_lowercase();

    if !lower.contains("accessibility") && !lower.contains("a11y") {
        out.warn("Consider mentioning accessibility", policy.design_accessibility_penalty);
    }

    let has_guidelines = context
        .get("brandGuidelines")
        .map(|v| !v.is_null() && v != &Value::Bool(false))
        .unwrap_or(false);
    if has_guidelines && !response.contains("brand") {
        out.warn("Brand guidelines may not be considered", 0);
    }
    out
}

fn check_analysis(response: &str, policy: &VerificationPolicy) -> CheckOutcome {
    let mut out = CheckOutcome::default();

    if !response.contains("source") && !response.contains("data from") {
        out.issue("No data sources cited", policy.analyst_source_penalty);
    }

    if !has_digits(response) && response.chars().count() > 200 {
        out.warn("Analysis may need specific numbers/metrics", 0);
    }
    out
}

fn check_marketing(response: &str, policy: &VerificationPolicy) -> CheckOutcome {
    let mut out = CheckOutcome::default();
    let lower = response.to_lowercase();

    if !CTA_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        out.warn("No clear call-to-action", policy.marketing_cta_penalty);
    }

    let hyperbole = HYPERBOLE_WORDS.iter().filter(|w| lower.contains(*w)).count();
    if hyperbole > 2 {
        out.warn(
            "May be overpromising - reduce superlatives",
            policy.marketing_hyperbole_penalty,
        );
    }
    out
}

/// 按 Agent 运行结构检查
pub fn structural_check(
    agent: AgentType,
    response: &str,
    context: &Map<String, Value>,
    policy: &VerificationPolicy,
) -> CheckOutcome {
    match agent {
        AgentType::Coder => check_code(response, policy),
        AgentType::Design => check_design(response, context, policy),
        AgentType::Analyst => check_analysis(response, policy),
        AgentType::Marketing => check_marketing(response, policy),
    }
}
