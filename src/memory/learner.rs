//! MemoryManager：LLM 驱动的长期记忆学习
//!
//! 每轮回复后用轻量模型分析一次交互，抽取输出偏好与新的模式，写回 MemoryStore。
//! 分析结果不是合法 JSON 时本次学习跳过，记忆保持不变。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::agents::AgentType;
use crate::llm::LlmClient;
use crate::memory::{
    AgentMemory, Interaction, LearnedPattern, Lesson, LongTermMemory, MemoryError, MemoryStore,
};

const ANALYSIS_MAX_TOKENS: u32 = 400;
const NEW_PATTERN_CONFIDENCE: f32 = 0.7;
/// 同一模式再次出现时的置信度增量
const REINFORCE_STEP: f32 = 0.05;
const EXAMPLE_CHARS: usize = 100;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Analysis {
    #[serde(default)]
    preference_signals: Option<PreferenceSignals>,
    #[serde(default)]
    new_pattern: Option<String>,
    #[serde(default)]
    lesson: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreferenceSignals {
    #[serde(default)]
    output_style: Option<String>,
}

/// 基于 MemoryStore + LLM 的长期记忆
pub struct MemoryManager {
    store: Arc<dyn MemoryStore>,
    llm: Arc<dyn LlmClient>,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn MemoryStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self { store, llm }
    }

    /// 添加用户自定义校验规则（重复规则忽略）
    pub async fn add_rule(
        &self,
        user_id: &str,
        agent: AgentType,
        rule: impl Into<String>,
    ) -> Result<AgentMemory, MemoryError> {
        let rule = rule.into();
        let mut memory = self.get(user_id, agent).await?;
        if !memory.verification_rules.iter().any(|r| *r == rule) {
            memory.verification_rules.push(rule);
            self.store.save(&memory).await?;
        }
        Ok(memory)
    }

    fn analysis_prompt(interaction: &Interaction) -> String {
        format!(
            "Analyze this AI interaction for learning:\n\
             User: \"{}\"\n\
             Assistant: \"{}\"\n\
             Approved: {}\n\n\
             Extract JSON Only:\n\
             {{\n  \"preferenceSignals\": {{ \"outputStyle\": \"concise|detailed|null\" }},\n  \
             \"newPattern\": \"one sentence description or null\",\n  \
             \"lesson\": \"what to do differently next time, or null\"\n}}",
            interaction.user_message, interaction.assistant_response, interaction.was_approved
        )
    }

    fn apply(memory: &mut AgentMemory, analysis: Analysis, interaction: &Interaction) -> bool {
        let mut changed = false;

        if let Some(style) = analysis
            .preference_signals
            .and_then(|p| p.output_style)
            .and_then(non_null)
        {
            if memory.preferences.output_style.as_deref() != Some(style.as_str()) {
                memory.preferences.output_style = Some(style);
                changed = true;
            }
        }

        if let Some(pattern) = analysis.new_pattern.and_then(non_null) {
            let example: String = interaction
                .assistant_response
                .chars()
                .take(EXAMPLE_CHARS)
                .collect();
            match memory
                .patterns
                .iter_mut()
                .find(|p| p.pattern.eq_ignore_ascii_case(&pattern))
            {
                Some(existing) => {
                    existing.confidence = (existing.confidence + REINFORCE_STEP).min(1.0);
                    existing.examples.push(example);
                }
                None => memory.patterns.push(LearnedPattern {
                    pattern,
                    examples: vec![example],
                    confidence: NEW_PATTERN_CONFIDENCE,
                }),
            }
            changed = true;
        }

        if !interaction.was_approved {
            if let Some(lesson) = analysis.lesson.and_then(non_null) {
                memory.lessons_learned.push(Lesson {
                    date: Utc::now().format("%Y-%m-%d").to_string(),
                    lesson,
                    applied: false,
                });
                changed = true;
            }
        }

        changed
    }
}

fn non_null(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() || t.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(t.to_string())
    }
}

/// 截取回复中第一个 `{` 到最后一个 `}` 之间的内容
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

#[async_trait]
impl LongTermMemory for MemoryManager {
    async fn get(&self, user_id: &str, agent: AgentType) -> Result<AgentMemory, MemoryError> {
        Ok(self
            .store
            .load(user_id, agent)
            .await?
            .unwrap_or_else(|| AgentMemory::new(user_id, agent)))
    }

    async fn record_interaction(
        &self,
        user_id: &str,
        agent: AgentType,
        interaction: Interaction,
    ) -> Result<(), MemoryError> {
        let mut memory = self.get(user_id, agent).await?;
        let answer = self
            .llm
            .ask(&Self::analysis_prompt(&interaction), ANALYSIS_MAX_TOKENS)
            .await?;

        let analysis = match extract_json(&answer).map(serde_json::from_str::<Analysis>) {
            Some(Ok(analysis)) => analysis,
            _ => {
                tracing::warn!(user_id, agent = %agent, "memory analysis was not valid JSON, skipping");
                return Ok(());
            }
        };

        if Self::apply(&mut memory, analysis, &interaction) {
            self.store.save(&memory).await?;
            tracing::debug!(user_id, agent = %agent, patterns = memory.patterns.len(), "long-term memory updated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptStep, ScriptedLlm};
    use crate::memory::InMemoryMemoryStore;

    fn interaction(approved: bool) -> Interaction {
        Interaction {
            user_message: "Write a parser".into(),
            assistant_response: "r".repeat(150),
            was_approved: approved,
            confidence: 80,
        }
    }

    fn manager(steps: Vec<ScriptStep>) -> (MemoryManager, Arc<InMemoryMemoryStore>) {
        let store = Arc::new(InMemoryMemoryStore::new());
        let llm = Arc::new(ScriptedLlm::new(steps));
        (MemoryManager::new(store.clone(), llm), store)
    }

    #[tokio::test]
    async fn test_learns_preference_and_pattern() {
        let (m, _) = manager(vec![ScriptStep::text(
            r#"Sure: {"preferenceSignals":{"outputStyle":"detailed"},"newPattern":"Prefers typed errors"}"#,
        )]);
        m.record_interaction("u1", AgentType::Coder, interaction(true))
            .await
            .unwrap();
        let mem = m.get("u1", AgentType::Coder).await.unwrap();
        assert_eq!(mem.preferences.output_style.as_deref(), Some("detailed"));
        assert_eq!(mem.patterns.len(), 1);
        assert_eq!(mem.patterns[0].confidence, 0.7);
        assert_eq!(mem.patterns[0].examples[0].len(), 100);
    }

    #[tokio::test]
    async fn test_repeated_pattern_is_reinforced() {
        let answer = r#"{"preferenceSignals":{"outputStyle":null},"newPattern":"Prefers tables"}"#;
        let (m, _) = manager(vec![ScriptStep::text(answer), ScriptStep::text(answer)]);
        for _ in 0..2 {
            m.record_interaction("u1", AgentType::Analyst, interaction(true))
                .await
                .unwrap();
        }
        let mem = m.get("u1", AgentType::Analyst).await.unwrap();
        assert_eq!(mem.patterns.len(), 1);
        assert!((mem.patterns[0].confidence - 0.75).abs() < 1e-6);
        assert_eq!(mem.preferences.output_style.as_deref(), Some("concise"));
    }

    #[tokio::test]
    async fn test_lesson_only_when_not_approved() {
        let answer = r#"{"newPattern":"null","lesson":"Cite the data source"}"#;
        let (m, _) = manager(vec![ScriptStep::text(answer), ScriptStep::text(answer)]);
        m.record_interaction("u1", AgentType::Analyst, interaction(true))
            .await
            .unwrap();
        assert!(m.get("u1", AgentType::Analyst).await.unwrap().lessons_learned.is_empty());
        m.record_interaction("u1", AgentType::Analyst, interaction(false))
            .await
            .unwrap();
        let mem = m.get("u1", AgentType::Analyst).await.unwrap();
        assert_eq!(mem.lessons_learned[0].lesson, "Cite the data source");
        assert!(mem.patterns.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_json_leaves_memory_untouched() {
        let (m, store) = manager(vec![ScriptStep::text("no json here")]);
        m.record_interaction("u1", AgentType::Coder, interaction(true))
            .await
            .unwrap();
        assert!(store.load("u1", AgentType::Coder).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_llm_error_is_reported() {
        let (m, _) = manager(vec![ScriptStep::error("down")]);
        let err = m
            .record_interaction("u1", AgentType::Coder, interaction(true))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Analysis(_)));
    }

    #[tokio::test]
    async fn test_add_rule_dedupes() {
        let (m, _) = manager(vec![]);
        m.add_rule("u1", AgentType::Marketing, "Use British spelling").await.unwrap();
        let mem = m
            .add_rule("u1", AgentType::Marketing, "Use British spelling")
            .await
            .unwrap();
        assert_eq!(mem.verification_rules, vec!["Use British spelling".to_string()]);
    }
}
