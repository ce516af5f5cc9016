//! 系统提示词组装

use crate::agents::AgentProfile;
use crate::memory::AgentMemory;
use crate::verification::VerificationResult;

/// 注入提示词的习得模式：置信度门槛与条数
const PATTERN_MIN_CONFIDENCE: f32 = 0.75;
const PATTERN_LIMIT: usize = 5;

const RESPONSE_POLICY: &str = "Response policy:\n\
- Be selective: use only the knowledge and tools relevant to this request.\n\
- Be concise: answer directly, without restating the question.\n";

const QUALITY_REQUIREMENTS: &str = "Quality Requirements:\n\
- Be specific and cite sources when possible\n\
- Flag any uncertainties explicitly\n";

/// 角色段 + 回复策略 + 知识 + 偏好 + 习得模式 + 质量要求
pub fn build_system_prompt(profile: &AgentProfile, knowledge: &str, memory: &AgentMemory) -> String {
    let mut prompt = profile.role_block();
    prompt.push('\n');
    prompt.push_str(RESPONSE_POLICY);

    if !knowledge.is_empty() {
        prompt.push('\n');
        prompt.push_str(knowledge.trim_end());
        prompt.push('\n');
    }

    let prefs = &memory.preferences;
    let lines: Vec<String> = [
        ("Output style", &prefs.output_style),
        ("Tone", &prefs.tone),
        ("Format", &prefs.format),
    ]
    .into_iter()
    .filter_map(|(label, value)| value.as_ref().map(|v| format!("- {}: {}", label, v)))
    .collect();
    if !lines.is_empty() {
        prompt.push_str("\nUser Preferences:\n");
        prompt.push_str(&lines.join("\n"));
        prompt.push('\n');
    }

    let patterns = memory.top_patterns(PATTERN_MIN_CONFIDENCE, PATTERN_LIMIT);
    if !patterns.is_empty() {
        prompt.push_str("\nLearned Patterns (follow these):\n");
        for p in patterns {
            prompt.push_str(&format!("- {}\n", p.pattern));
        }
    }

    prompt.push('\n');
    prompt.push_str(QUALITY_REQUIREMENTS);
    prompt
}

/// 第二次尝试时追加的修订说明
pub fn revision_notes(previous: &VerificationResult) -> String {
    let mut notes = String::from("\nRevision notes (the previous draft did not pass review):\n");
    for issue in &previous.issues {
        notes.push_str(&format!("- Fix: {}\n", issue));
    }
    for warning in &previous.warnings {
        notes.push_str(&format!("- Address: {}\n", warning));
    }
    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentProfiles, AgentType};
    use crate::memory::LearnedPattern;

    #[test]
    fn test_prompt_sections() {
        let profiles = AgentProfiles::builtin();
        let mut memory = AgentMemory::new("u", AgentType::Analyst);
        memory.patterns = vec![
            LearnedPattern {
                pattern: "Lead with the headline number".into(),
                examples: vec![],
                confidence: 0.9,
            },
            LearnedPattern {
                pattern: "Too weak to mention".into(),
                examples: vec![],
                confidence: 0.7,
            },
        ];
        let prompt = build_system_prompt(
            profiles.get(AgentType::Analyst),
            "Knowledge Base Reference:\n\n**metrics:**\n- **ARPU**: revenue per user\n\n",
            &memory,
        );
        assert!(prompt.contains("Be selective"));
        assert!(prompt.contains("**ARPU**"));
        assert!(prompt.contains("- Output style: concise\n- Tone: professional\n"));
        assert!(prompt.contains("- Lead with the headline number"));
        assert!(!prompt.contains("Too weak"));
        assert!(prompt.ends_with("- Flag any uncertainties explicitly\n"));
    }

    #[test]
    fn test_revision_notes() {
        let previous = VerificationResult {
            passed: false,
            confidence: 80,
            issues: vec!["No data sources cited".into()],
            warnings: vec![],
            should_escalate: true,
        };
        assert!(revision_notes(&previous).contains("- Fix: No data sources cited"));
    }
}
