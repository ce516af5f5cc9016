//! Agent 推断：附件文件名关键词 + 可选的 LLM 分类

use crate::llm::LlmClient;
use crate::memory::AttachmentRef;

use super::AgentType;

const DESIGN_KEYWORDS: &[&str] = &[
    "mockup",
    "wireframe",
    "design",
    "figma",
    "sketch",
    "ui",
    "ux",
    "prototype",
    "layout",
    "template",
    "component",
];

const DATA_KEYWORDS: &[&str] = &[
    "chart",
    "graph",
    "data",
    "analytics",
    "report",
    "dashboard",
    "metrics",
    "statistics",
    "table",
    "spreadsheet",
];

const CODE_KEYWORDS: &[&str] = &[
    "code",
    "screenshot",
    "terminal",
    "console",
    "error",
    "debug",
    "stack",
    "logs",
];

/// 按文件名推断 Agent，优先级 design > analyst > coder
pub fn detect_from_filename(filename: &str) -> Option<AgentType> {
    let lower = filename.to_lowercase();
    let hit = |keywords: &[&str]| keywords.iter().any(|kw| lower.contains(kw));
    if hit(DESIGN_KEYWORDS) {
        Some(AgentType::Design)
    } else if hit(DATA_KEYWORDS) {
        Some(AgentType::Analyst)
    } else if hit(CODE_KEYWORDS) {
        Some(AgentType::Coder)
    } else {
        None
    }
}

/// 取第一个能推断出 Agent 的附件
pub fn detect_from_attachments(attachments: &[AttachmentRef]) -> Option<AgentType> {
    attachments
        .iter()
        .find_map(|a| detect_from_filename(&a.filename))
}

fn route_prompt(message: &str) -> String {
    format!(
        "Classify this request into ONE category:\n\
         - design: UI/UX, visual design, branding, mockups\n\
         - analyst: data analysis, statistics, reports, sheets\n\
         - coder: programming, debugging, technical tasks\n\
         - marketing: content, SEO, social media\n\n\
         Message: \"{}\"\n\
         Reply with ONLY the category name.",
        message
    )
}

/// 让轻量模型对请求分类；调用失败或回答无法解析时返回 None
pub async fn route_with_llm(llm: &dyn LlmClient, message: &str) -> Option<AgentType> {
    match llm.ask(&route_prompt(message), 50).await {
        Ok(answer) => {
            let word = answer
                .split(|c: char| !c.is_alphabetic())
                .find(|w| !w.is_empty())
                .unwrap_or("");
            match word.parse::<AgentType>() {
                Ok(agent) => Some(agent),
                Err(e) => {
                    tracing::debug!(answer = %answer, "router answer not understood: {}", e);
                    None
                }
            }
        }
        Err(e) => {
            tracing::warn!("agent routing failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptStep, ScriptedLlm};

    #[test]
    fn test_filename_priority() {
        assert_eq!(detect_from_filename("Login-Mockup.png"), Some(AgentType::Design));
        assert_eq!(detect_from_filename("q3_dashboard.png"), Some(AgentType::Analyst));
        assert_eq!(detect_from_filename("terminal-output.png"), Some(AgentType::Coder));
        assert_eq!(detect_from_filename("holiday.jpg"), None);
        // "ui" 命中 design，先于 data
        assert_eq!(detect_from_filename("ui_data.png"), Some(AgentType::Design));
    }

    #[test]
    fn test_detect_from_attachments_skips_unknown() {
        let attachments = vec![
            AttachmentRef::new("a1", "cat.jpg", "image/jpeg", 10),
            AttachmentRef::new("a2", "sales_report.png", "image/png", 10),
        ];
        assert_eq!(detect_from_attachments(&attachments), Some(AgentType::Analyst));
    }

    #[tokio::test]
    async fn test_route_with_llm() {
        let llm = ScriptedLlm::new(vec![
            ScriptStep::text("Marketing."),
            ScriptStep::text("none of them"),
            ScriptStep::error("boom"),
        ]);
        assert_eq!(route_with_llm(&llm, "write a tweet").await, Some(AgentType::Marketing));
        assert_eq!(route_with_llm(&llm, "hello").await, None);
        assert_eq!(route_with_llm(&llm, "hello").await, None);
    }
}
