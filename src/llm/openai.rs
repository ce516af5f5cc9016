//! OpenAI 兼容 API 客户端
//!
//! 直接请求 `{base_url}/chat/completions`（function tools 格式），可对接 OpenAI、DeepSeek、自建代理等。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::LlmSection;
use crate::llm::{
    ChatMessage, Completion, CompletionOutput, CompletionRequest, LlmClient, LlmError, ModelTier,
    ToolUse, Usage,
};
use crate::memory::Role;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI 兼容客户端：持有 HTTP Client、主模型与轻量模型名
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    fast_model: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiCompatClient {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        fast_model: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            fast_model: fast_model.to_string(),
            usage: TokenUsage::new(),
        })
    }

    /// 从 [llm] 段创建；没有 API Key 时返回 None（调用方退回 Mock）
    pub fn from_config(section: &LlmSection) -> Result<Option<Self>, LlmError> {
        let api_key = section
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty());
        let Some(api_key) = api_key else {
            return Ok(None);
        };
        Self::new(
            section.base_url.as_deref(),
            &section.model,
            &section.fast_model,
            &api_key,
            Duration::from_secs(section.request_timeout_secs),
        )
        .map(Some)
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.model,
            ModelTier::Fast => &self.fast_model,
        }
    }

    fn message_json(m: &ChatMessage) -> Value {
        let role = match m.role {
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        if m.attachments.is_empty() {
            return json!({ "role": role, "content": m.content });
        }
        let mut parts = vec![json!({ "type": "text", "text": m.content })];
        for a in &m.attachments {
            parts.push(json!({
                "type": "image_url",
                "image_url": { "url": a.data_url }
            }));
        }
        json!({ "role": role, "content": parts })
    }

    fn request_body(&self, request: &CompletionRequest, extra: Vec<Value>) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + extra.len() + 1);
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        messages.extend(request.messages.iter().map(Self::message_json));
        messages.extend(extra);

        let mut body = json!({
            "model": self.model_for(request.tier),
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }

    async fn send(&self, body: Value) -> Result<Completion, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        self.usage.add(usage.input_tokens, usage.output_tokens);

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("no choices".to_string()))?;

        let output = match choice.message.tool_calls.into_iter().next() {
            Some(call) => {
                let args = if call.function.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.function.arguments)
                        .map_err(|e| LlmError::InvalidResponse(format!("tool arguments: {}", e)))?
                };
                CompletionOutput::ToolUse(ToolUse {
                    id: call.id,
                    name: call.function.name,
                    args,
                })
            }
            None => CompletionOutput::Text(choice.message.content.unwrap_or_default()),
        };

        Ok(Completion {
            output,
            usage,
            stop_reason: choice.finish_reason,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.send(self.request_body(request, Vec::new())).await
    }

    async fn resume_after_tool(
        &self,
        request: &CompletionRequest,
        tool_use: &ToolUse,
        result: &str,
    ) -> Result<Completion, LlmError> {
        let extra = vec![
            json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": tool_use.id,
                    "type": "function",
                    "function": {
                        "name": tool_use.name,
                        "arguments": tool_use.args.to_string(),
                    }
                }]
            }),
            json!({
                "role": "tool",
                "tool_call_id": tool_use.id,
                "content": result,
            }),
        ];
        self.send(self.request_body(request, extra)).await
    }
}
