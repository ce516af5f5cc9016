//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SQUAD__*` 覆盖（双下划线表示嵌套，如 `SQUAD__LLM__MODEL=gpt-4o`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::verification::VerificationPolicy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub state: StateSection,
    #[serde(default)]
    pub knowledge: KnowledgeSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub verification: VerificationPolicy,
    #[serde(default)]
    pub agents: AgentsSection,
}

/// [app] 段：应用名、SQLite 数据库位置、上下文窗口
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// sqlx 连接串，未设置时用 sqlite://squad.db
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// 每轮送入 LLM 的历史消息条数（不含本轮用户消息）
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// 每轮最多尝试次数（含校验失败后的重试）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            database_url: default_database_url(),
            context_window: default_context_window(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://squad.db?mode=rwc".to_string()
}

fn default_context_window() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    2
}

/// [llm] 段：OpenAI 兼容后端与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    /// 轻量模型：用于规则判定、Agent 路由与知识检索
    #[serde(default = "default_fast_model")]
    pub fast_model: String,
    pub base_url: Option<String>,
    /// 未设置时读取 OPENAI_API_KEY；都没有则退回 Mock
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            fast_model: default_fast_model(),
            base_url: None,
            api_key: None,
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_fast_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout() -> u64 {
    60
}

/// [state] 段：热层 TTL 与冷存储同步
#[derive(Debug, Clone, Deserialize)]
pub struct StateSection {
    /// 热层会话存活时间（秒）
    #[serde(default = "default_hot_ttl")]
    pub hot_ttl_secs: u64,
    /// 同步 worker 每批处理的会话数
    #[serde(default = "default_sync_batch")]
    pub sync_batch_size: usize,
    /// 同步 worker 空闲轮询间隔（毫秒）
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,
    /// 单个同步任务最多尝试次数
    #[serde(default = "default_max_sync_attempts")]
    pub max_sync_attempts: u32,
    /// 后台清扫间隔（秒）：淘汰过期热层会话与失效的知识库缓存
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            hot_ttl_secs: default_hot_ttl(),
            sync_batch_size: default_sync_batch(),
            sync_interval_ms: default_sync_interval(),
            max_sync_attempts: default_max_sync_attempts(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_hot_ttl() -> u64 {
    3600
}

fn default_sync_batch() -> usize {
    10
}

fn default_sync_interval() -> u64 {
    500
}

fn default_max_sync_attempts() -> u32 {
    5
}

fn default_sweep_interval() -> u64 {
    60
}

/// [knowledge] 段：知识库缓存与检索
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeSection {
    /// 查询结果缓存（秒），默认 7 天
    #[serde(default = "default_query_ttl")]
    pub query_ttl_secs: u64,
    /// 检索结果缓存（秒）
    #[serde(default = "default_search_ttl")]
    pub search_ttl_secs: u64,
    /// 语义检索时交给 LLM 挑选的候选条目数
    #[serde(default = "default_semantic_candidates")]
    pub semantic_candidates: usize,
    /// 注入提示词的知识条目上限
    #[serde(default = "default_context_entries")]
    pub context_entries: usize,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            query_ttl_secs: default_query_ttl(),
            search_ttl_secs: default_search_ttl(),
            semantic_candidates: default_semantic_candidates(),
            context_entries: default_context_entries(),
        }
    }
}

fn default_query_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_search_ttl() -> u64 {
    3600
}

fn default_semantic_candidates() -> usize {
    50
}

fn default_context_entries() -> usize {
    5
}

/// [tools] 段：工具调用超时与各 Agent 的工具服务器
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 握手超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 按 Agent 名配置的 stdio 工具服务器：[tools.servers.coder]
    #[serde(default)]
    pub servers: HashMap<String, ToolServerSection>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            servers: HashMap::new(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// [tools.servers.<agent>] 段：启动命令
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ToolServerSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// [agents] 段：默认 Agent 与自动路由
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsSection {
    /// 未指定且无法从附件推断时使用的 Agent
    #[serde(default = "default_agent")]
    pub default_agent: String,
    /// 是否让 LLM 对未指定 Agent 的请求做分类
    #[serde(default)]
    pub auto_route: bool,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            default_agent: default_agent(),
            auto_route: false,
        }
    }
}

fn default_agent() -> String {
    "coder".to_string()
}

/// 从 config 目录加载配置，环境变量 SQUAD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（显式指定的文件必须存在）
/// 3. 最后叠加环境变量 SQUAD__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SQUAD")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.context_window, 10);
        assert_eq!(cfg.app.max_attempts, 2);
        assert_eq!(cfg.state.hot_ttl_secs, 3600);
        assert_eq!(cfg.state.sync_batch_size, 10);
        assert_eq!(cfg.knowledge.semantic_candidates, 50);
        assert_eq!(cfg.verification.escalation_threshold, 70);
        assert_eq!(cfg.agents.default_agent, "coder");
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[llm]
model = "local-model"

[verification]
escalation_threshold = 60

[tools.servers.coder]
command = "node"
args = ["server.js"]
"#
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.llm.model, "local-model");
        assert_eq!(cfg.verification.escalation_threshold, 60);
        assert_eq!(cfg.verification.rule_penalty, 15);
        let coder = cfg.tools.servers.get("coder").unwrap();
        assert_eq!(coder.command, "node");
        assert_eq!(coder.args, vec!["server.js".to_string()]);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let res = load_config(Some(PathBuf::from("/nonexistent/squad.toml")));
        assert!(res.is_err());
    }
}
