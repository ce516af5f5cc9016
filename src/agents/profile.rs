//! Agent 画像：职责、限制、数据源授权、视觉能力、工具并发上限与升级阈值
//!
//! 进程启动时构建一次（`AgentProfiles::builtin`），之后只读。

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 专职 Agent 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Design,
    Analyst,
    Coder,
    Marketing,
}

impl AgentType {
    pub const ALL: [AgentType; 4] = [
        AgentType::Design,
        AgentType::Analyst,
        AgentType::Coder,
        AgentType::Marketing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Design => "design",
            AgentType::Analyst => "analyst",
            AgentType::Coder => "coder",
            AgentType::Marketing => "marketing",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "design" => Ok(AgentType::Design),
            "analyst" => Ok(AgentType::Analyst),
            "coder" => Ok(AgentType::Coder),
            "marketing" => Ok(AgentType::Marketing),
            other => Err(format!("unknown agent type: {}", other)),
        }
    }
}

/// 数据源授权级别，primary > secondary > reference_only
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    ReferenceOnly = 1,
    Secondary = 2,
    Primary = 3,
}

/// 数据源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Figma,
    GoogleSheets,
    Github,
    Judge0Api,
    LocalKb,
    UserInput,
    WebApi,
    FileUpload,
    Api,
    Manual,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Figma => "figma",
            SourceType::GoogleSheets => "google_sheets",
            SourceType::Github => "github",
            SourceType::Judge0Api => "judge0_api",
            SourceType::LocalKb => "local_kb",
            SourceType::UserInput => "user_input",
            SourceType::WebApi => "web_api",
            SourceType::FileUpload => "file_upload",
            SourceType::Api => "api",
            SourceType::Manual => "manual",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = match s.trim() {
            "figma" => SourceType::Figma,
            "google_sheets" => SourceType::GoogleSheets,
            "github" => SourceType::Github,
            "judge0_api" => SourceType::Judge0Api,
            "local_kb" => SourceType::LocalKb,
            "user_input" => SourceType::UserInput,
            "web_api" => SourceType::WebApi,
            "file_upload" => SourceType::FileUpload,
            "api" => SourceType::Api,
            "manual" => SourceType::Manual,
            other => return Err(format!("unknown source type: {}", other)),
        };
        Ok(source)
    }
}

/// 单个数据源授权
#[derive(Debug, Clone, Serialize)]
pub struct DataSource {
    pub source: SourceType,
    pub authority: Authority,
    pub description: &'static str,
}

/// 视觉能力：能否看图、接受的 MIME、大小上限
#[derive(Debug, Clone, Serialize)]
pub struct VisionCapabilities {
    pub can_analyze: bool,
    pub mime_types: Vec<&'static str>,
    pub max_size: u64,
}

/// 附件被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentRejection {
    VisionUnsupported,
    MimeType(String),
    TooLarge(u64),
}

/// Agent 画像
#[derive(Debug, Clone, Serialize)]
pub struct AgentProfile {
    pub agent: AgentType,
    pub display_name: &'static str,
    pub role: &'static str,
    pub description: &'static str,
    pub responsibilities: Vec<&'static str>,
    pub restrictions: Vec<&'static str>,
    pub data_sources: Vec<DataSource>,
    pub knowledge_categories: Vec<&'static str>,
    pub vision: VisionCapabilities,
    /// 同时进行的工具调用上限
    pub tool_limit: usize,
    /// 该 Agent 期望的置信度下限（0-100）
    pub confidence_threshold: u8,
}

const MAX_IMAGE_SIZE: u64 = 5 * 1024 * 1024;
const IMAGE_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

impl AgentProfile {
    /// 授权判定：数据源不在表中一律拒绝；在表中则比较级别
    pub fn has_authority(&self, source: SourceType, required: Authority) -> bool {
        self.authority_for(source)
            .map(|granted| granted >= required)
            .unwrap_or(false)
    }

    pub fn authority_for(&self, source: SourceType) -> Option<Authority> {
        self.data_sources
            .iter()
            .find(|d| d.source == source)
            .map(|d| d.authority)
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.knowledge_categories.iter().any(|c| *c == category)
    }

    /// 检查附件能否交给该 Agent 分析
    pub fn validate_attachment(&self, mime_type: &str, size: u64) -> Result<(), AttachmentRejection> {
        if !self.vision.can_analyze {
            return Err(AttachmentRejection::VisionUnsupported);
        }
        if !self.vision.mime_types.iter().any(|m| *m == mime_type) {
            return Err(AttachmentRejection::MimeType(mime_type.to_string()));
        }
        if size > self.vision.max_size {
            return Err(AttachmentRejection::TooLarge(size));
        }
        Ok(())
    }

    /// 把拒绝原因转为给用户看的提示
    pub fn rejection_message(&self, filename: &str, rejection: &AttachmentRejection) -> String {
        match rejection {
            AttachmentRejection::VisionUnsupported => {
                format!("{} cannot analyze images ({} ignored)", self.display_name, filename)
            }
            AttachmentRejection::MimeType(mime) => {
                format!("{} does not support {} ({} ignored)", self.display_name, mime, filename)
            }
            AttachmentRejection::TooLarge(_) => format!(
                "Image exceeds size limit for {} ({} ignored)",
                self.display_name, filename
            ),
        }
    }

    /// 系统提示词中的角色段落
    pub fn role_block(&self) -> String {
        let mut out = format!(
            "You are the {} ({}). {}.\n",
            self.display_name, self.role, self.description
        );
        out.push_str("\nResponsibilities:\n");
        for r in &self.responsibilities {
            out.push_str(&format!("- {}\n", r));
        }
        out.push_str("\nRestrictions:\n");
        for r in &self.restrictions {
            out.push_str(&format!("- {}\n", r));
        }
        out.push_str("\nAuthorized data sources:\n");
        for d in &self.data_sources {
            let level = match d.authority {
                Authority::Primary => "primary",
                Authority::Secondary => "secondary",
                Authority::ReferenceOnly => "reference only",
            };
            out.push_str(&format!("- {} ({}): {}\n", d.source, level, d.description));
        }
        out.push_str(&format!(
            "\nIf your confidence in an answer is below {}%, say so explicitly.\n",
            self.confidence_threshold
        ));
        out
    }
}

fn source(source: SourceType, authority: Authority, description: &'static str) -> DataSource {
    DataSource {
        source,
        authority,
        description,
    }
}

/// 全部 Agent 画像（静态表）
#[derive(Debug, Clone)]
pub struct AgentProfiles {
    profiles: HashMap<AgentType, AgentProfile>,
}

impl AgentProfiles {
    pub fn builtin() -> Self {
        use Authority::{Primary, Secondary};
        use SourceType::*;

        let design = AgentProfile {
            agent: AgentType::Design,
            display_name: "Creative Director",
            role: "UI/UX Expert",
            description: "Specialized in visual design, user experience, and design systems",
            responsibilities: vec![
                "Review and critique design mockups",
                "Provide accessibility recommendations",
                "Suggest design improvements based on best practices",
                "Analyze user interface patterns",
                "Recommend component structure",
                "Evaluate visual hierarchy and consistency",
            ],
            restrictions: vec![
                "Cannot execute code or run systems",
                "Cannot access sensitive user data directly",
                "Cannot make architectural decisions alone (must consult coder)",
                "Cannot approve final designs without user consent",
            ],
            data_sources: vec![
                source(Figma, Primary, "Design system and component library"),
                source(FileUpload, Primary, "User-uploaded design assets"),
                source(UserInput, Primary, "Direct user feedback and requirements"),
                source(LocalKb, Primary, "Brand guidelines and design patterns"),
                source(Manual, Secondary, "Manually curated design notes"),
            ],
            knowledge_categories: vec![
                "color_theory",
                "typography",
                "accessibility",
                "design_patterns",
                "ui_components",
                "brand_guidelines",
                "design_principles",
            ],
            vision: VisionCapabilities {
                can_analyze: true,
                mime_types: vec!["image/jpeg", "image/png", "image/webp", "image/svg+xml"],
                max_size: MAX_IMAGE_SIZE,
            },
            tool_limit: 3,
            confidence_threshold: 75,
        };

        let analyst = AgentProfile {
            agent: AgentType::Analyst,
            display_name: "Data Strategist",
            role: "Data Analyst",
            description: "Specialized in data analysis, trend identification, and strategic insights",
            responsibilities: vec![
                "Analyze data from spreadsheets and databases",
                "Generate insights from data patterns",
                "Calculate ROI and business metrics",
                "Identify trends and anomalies",
                "Create data-driven recommendations",
                "Validate data quality and accuracy",
            ],
            restrictions: vec![
                "Cannot modify data without explicit user approval",
                "Cannot access sensitive personal information",
                "Cannot make final business decisions (advisory only)",
                "Must cite data sources in all analysis",
            ],
            data_sources: vec![
                source(GoogleSheets, Primary, "Sales, inventory, and financial data"),
                source(FileUpload, Primary, "User-uploaded CSV, Excel, or data files"),
                source(LocalKb, Primary, "Historical analysis and benchmarks"),
                source(WebApi, Secondary, "Public APIs for market data"),
                source(Api, Secondary, "Third-party data APIs"),
                source(Manual, Secondary, "Manually entered reference data"),
            ],
            knowledge_categories: vec![
                "statistical_methods",
                "data_analysis",
                "metrics",
                "roi_calculation",
                "trend_analysis",
                "benchmarks",
                "data_interpretation",
            ],
            vision: VisionCapabilities {
                can_analyze: true,
                mime_types: IMAGE_TYPES.to_vec(),
                max_size: MAX_IMAGE_SIZE,
            },
            tool_limit: 5,
            confidence_threshold: 80,
        };

        let coder = AgentProfile {
            agent: AgentType::Coder,
            display_name: "Code Specialist",
            role: "Full-Stack Developer",
            description: "Specialized in software architecture, code quality, and implementation",
            responsibilities: vec![
                "Review code for quality and security",
                "Provide architecture recommendations",
                "Suggest performance optimizations",
                "Execute and debug code",
                "Generate code templates and solutions",
                "Identify technical debt and refactoring opportunities",
            ],
            restrictions: vec![
                "Cannot deploy code to production without approval",
                "Cannot access external systems without proper credentials",
                "Cannot modify existing code without version control",
                "Cannot make design decisions alone (must consult designer)",
            ],
            data_sources: vec![
                source(Github, Primary, "Code repositories and version history"),
                source(Judge0Api, Primary, "Code execution and testing"),
                source(FileUpload, Primary, "User-uploaded code snippets"),
                source(LocalKb, Primary, "Code templates and architecture patterns"),
                source(Api, Secondary, "Package registries and documentation APIs"),
                source(Manual, Secondary, "Manually curated engineering notes"),
            ],
            knowledge_categories: vec![
                "code_templates",
                "best_practices",
                "error_handling",
                "frameworks",
                "security_patterns",
                "performance_optimization",
                "architecture_patterns",
            ],
            vision: VisionCapabilities {
                can_analyze: true,
                mime_types: IMAGE_TYPES.to_vec(),
                max_size: MAX_IMAGE_SIZE,
            },
            tool_limit: 4,
            confidence_threshold: 70,
        };

        let marketing = AgentProfile {
            agent: AgentType::Marketing,
            display_name: "Growth Hacker",
            role: "Marketing Lead",
            description: "Specialized in marketing strategy, copywriting, and customer engagement",
            responsibilities: vec![
                "Create compelling marketing copy",
                "Analyze customer behavior and messaging",
                "Recommend campaign strategies",
                "Suggest growth tactics",
                "Evaluate brand consistency",
                "Provide content recommendations",
            ],
            restrictions: vec![
                "Cannot make financial commitments",
                "Cannot access customer personal data",
                "Cannot send communications without user approval",
                "Must comply with all marketing regulations",
            ],
            data_sources: vec![
                source(LocalKb, Primary, "Marketing guidelines and brand voice"),
                source(Manual, Primary, "Curated campaign playbooks"),
                source(UserInput, Primary, "Campaign ideas and target audience"),
                source(WebApi, Secondary, "Market trends and industry data"),
                source(FileUpload, Secondary, "Marketing assets and competitor analysis"),
                source(Api, Secondary, "Advertising and analytics APIs"),
            ],
            knowledge_categories: vec![
                "content_templates",
                "audience_insights",
                "campaign_strategies",
                "copywriting_formulas",
                "seo_practices",
                "social_media_tactics",
                "customer_behavior",
            ],
            vision: VisionCapabilities {
                can_analyze: true,
                mime_types: IMAGE_TYPES.to_vec(),
                max_size: MAX_IMAGE_SIZE,
            },
            tool_limit: 3,
            confidence_threshold: 75,
        };

        let profiles = [design, analyst, coder, marketing]
            .into_iter()
            .map(|p| (p.agent, p))
            .collect();
        Self { profiles }
    }

    pub fn get(&self, agent: AgentType) -> &AgentProfile {
        // builtin 覆盖全部 AgentType
        &self.profiles[&agent]
    }

    /// 可访问某数据源的所有 Agent
    pub fn agents_for_source(&self, source: SourceType) -> Vec<AgentType> {
        AgentType::ALL
            .into_iter()
            .filter(|a| self.get(*a).authority_for(source).is_some())
            .collect()
    }
}

impl Default for AgentProfiles {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authority_levels() {
        let profiles = AgentProfiles::builtin();
        let analyst = profiles.get(AgentType::Analyst);
        assert!(analyst.has_authority(SourceType::GoogleSheets, Authority::Primary));
        assert!(analyst.has_authority(SourceType::WebApi, Authority::Secondary));
        assert!(!analyst.has_authority(SourceType::WebApi, Authority::Primary));
        assert!(!analyst.has_authority(SourceType::Github, Authority::ReferenceOnly));
    }

    #[test]
    fn test_thresholds_and_limits() {
        let profiles = AgentProfiles::builtin();
        assert_eq!(profiles.get(AgentType::Design).tool_limit, 3);
        assert_eq!(profiles.get(AgentType::Analyst).confidence_threshold, 80);
        assert_eq!(profiles.get(AgentType::Coder).tool_limit, 4);
        assert_eq!(profiles.get(AgentType::Marketing).confidence_threshold, 75);
    }

    #[test]
    fn test_validate_attachment() {
        let profiles = AgentProfiles::builtin();
        let design = profiles.get(AgentType::Design);
        assert!(design.validate_attachment("image/svg+xml", 1024).is_ok());
        let coder = profiles.get(AgentType::Coder);
        assert_eq!(
            coder.validate_attachment("image/svg+xml", 1024),
            Err(AttachmentRejection::MimeType("image/svg+xml".into()))
        );
        assert_eq!(
            coder.validate_attachment("image/png", MAX_IMAGE_SIZE + 1),
            Err(AttachmentRejection::TooLarge(MAX_IMAGE_SIZE + 1))
        );
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("Coder".parse::<AgentType>().unwrap(), AgentType::Coder);
        assert!("lawyer".parse::<AgentType>().is_err());
        assert_eq!("google_sheets".parse::<SourceType>().unwrap(), SourceType::GoogleSheets);
        assert!("ftp".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_agents_for_source() {
        let profiles = AgentProfiles::builtin();
        assert_eq!(profiles.agents_for_source(SourceType::Github), vec![AgentType::Coder]);
        assert_eq!(profiles.agents_for_source(SourceType::LocalKb).len(), 4);
    }
}
