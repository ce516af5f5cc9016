//! stdio 工具服务器桥接（MCP 风格 JSON-RPC 2.0，每行一条消息）
//!
//! connect 时按 [tools.servers.<agent>] 启动子进程并完成 initialize 握手；
//! 子进程以 kill_on_drop 启动，会话被丢弃时也不会残留。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::agents::AgentType;
use crate::config::{ToolServerSection, ToolsSection};
use crate::tools::{ToolBridge, ToolError, ToolSession, ToolSpec};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// 按 Agent 启动 stdio 工具服务器
pub struct StdioToolBridge {
    servers: HashMap<String, ToolServerSection>,
    connect_timeout: Duration,
}

impl StdioToolBridge {
    pub fn new(servers: HashMap<String, ToolServerSection>, connect_timeout: Duration) -> Self {
        Self {
            servers,
            connect_timeout,
        }
    }

    pub fn from_config(section: &ToolsSection) -> Self {
        Self::new(
            section.servers.clone(),
            Duration::from_secs(section.connect_timeout_secs),
        )
    }
}

#[async_trait]
impl ToolBridge for StdioToolBridge {
    async fn connect(&self, agent: AgentType) -> Result<Arc<dyn ToolSession>, ToolError> {
        let server = self
            .servers
            .get(agent.as_str())
            .ok_or(ToolError::NotConfigured(agent))?;
        let session = StdioToolSession::spawn(server)?;
        match tokio::time::timeout(self.connect_timeout, session.initialize()).await {
            Ok(Ok(())) => {
                tracing::info!(agent = %agent, command = %server.command, "tool server connected");
                Ok(Arc::new(session))
            }
            Ok(Err(e)) => {
                session.close().await;
                Err(ToolError::Handshake(e.to_string()))
            }
            Err(_) => {
                session.close().await;
                Err(ToolError::Handshake(format!(
                    "no initialize response within {}s",
                    self.connect_timeout.as_secs()
                )))
            }
        }
    }
}

struct Connection {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// 一个 stdio 工具会话：请求串行化（同一时刻只有一个未完成请求）
pub struct StdioToolSession {
    conn: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl StdioToolSession {
    fn spawn(server: &ToolServerSection) -> Result<Self, ToolError> {
        let mut child = Command::new(&server.command)
            .args(&server.args)
            .envs(&server.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Spawn(format!("{}: {}", server.command, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Spawn("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Spawn("stdout not captured".to_string()))?;
        Ok(Self {
            conn: Mutex::new(Some(Connection {
                child,
                stdin,
                stdout: BufReader::new(stdout).lines(),
            })),
            next_id: AtomicU64::new(1),
        })
    }

    async fn initialize(&self) -> Result<(), ToolError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "squad", "version": env!("CARGO_PKG_VERSION") }
            }),
        )
        .await?;
        self.notify("notifications/initialized", json!({})).await
    }

    async fn write_line(conn: &mut Connection, msg: &Value) -> Result<(), ToolError> {
        let mut line = msg.to_string();
        line.push('\n');
        conn.stdin.write_all(line.as_bytes()).await?;
        conn.stdin.flush().await?;
        Ok(())
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), ToolError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(ToolError::Closed)?;
        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        Self::write_line(conn, &msg).await
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or(ToolError::Closed)?;
        let msg = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        Self::write_line(conn, &msg).await?;

        loop {
            let line = conn
                .stdout
                .next_line()
                .await?
                .ok_or_else(|| ToolError::Protocol("tool server closed stdout".to_string()))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(line = %line, "skipping non-JSON line from tool server: {}", e);
                    continue;
                }
            };
            // 通知或其它请求的响应
            if value.get("id").and_then(Value::as_u64) != Some(id) {
                continue;
            }
            return parse_response(value);
        }
    }
}

/// 解析 JSON-RPC 响应：error 优先，否则取 result
fn parse_response(value: Value) -> Result<Value, ToolError> {
    if let Some(err) = value.get("error") {
        return Err(ToolError::Remote {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    value
        .get("result")
        .cloned()
        .ok_or_else(|| ToolError::Protocol("response without result".to_string()))
}

/// tools/call 的结果：拼接所有 text 内容；isError 为真时视为工具失败
fn call_result_text(result: &Value) -> Result<String, ToolError> {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|c| c.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|c| c.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        Err(ToolError::Failed(text))
    } else {
        Ok(text)
    }
}

#[async_trait]
impl ToolSession for StdioToolSession {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolError> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|e| ToolError::Protocol(e.to_string()))
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<String, ToolError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": args }))
            .await?;
        call_result_text(&result)
    }

    async fn close(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(mut conn) = conn {
            drop(conn.stdin);
            if let Err(e) = conn.child.start_kill() {
                tracing::debug!("tool server already exited: {}", e);
            }
            let _ = tokio::time::timeout(Duration::from_secs(2), conn.child.wait()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let ok = parse_response(json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}})).unwrap();
        assert_eq!(ok, json!({"tools": []}));

        let err = parse_response(json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "Method not found"}}))
            .unwrap_err();
        assert!(matches!(err, ToolError::Remote { code: -32601, .. }));

        assert!(matches!(
            parse_response(json!({"jsonrpc": "2.0", "id": 1})),
            Err(ToolError::Protocol(_))
        ));
    }

    #[test]
    fn test_call_result_text() {
        let r = json!({"content": [{"type": "text", "text": "a"}, {"type": "image", "data": "x"}, {"type": "text", "text": "b"}]});
        assert_eq!(call_result_text(&r).unwrap(), "a\nb");

        let r = json!({"content": [{"type": "text", "text": "division by zero"}], "isError": true});
        assert!(matches!(call_result_text(&r), Err(ToolError::Failed(m)) if m == "division by zero"));
    }

    #[tokio::test]
    async fn test_unconfigured_agent() {
        let bridge = StdioToolBridge::new(HashMap::new(), Duration::from_secs(1));
        let err = bridge.connect(AgentType::Coder).await.err().unwrap();
        assert!(matches!(err, ToolError::NotConfigured(AgentType::Coder)));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut servers = HashMap::new();
        servers.insert(
            "coder".to_string(),
            ToolServerSection {
                command: "/nonexistent/tool-server".to_string(),
                ..Default::default()
            },
        );
        let bridge = StdioToolBridge::new(servers, Duration::from_secs(1));
        let err = bridge.connect(AgentType::Coder).await.err().unwrap();
        assert!(matches!(err, ToolError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_handshake_with_shell_server() {
        // 最小 stdio 服务器：依次回应 initialize、tools/list、tools/call
        let script = r#"
read init
echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{}}}'
read initialized
read list
echo '{"jsonrpc":"2.0","method":"notifications/progress","params":{}}'
echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"echo","inputSchema":{"type":"object"}}]}}'
read call
echo '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"pong"}]}}'
"#;
        let mut servers = HashMap::new();
        servers.insert(
            "coder".to_string(),
            ToolServerSection {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                ..Default::default()
            },
        );
        let bridge = StdioToolBridge::new(servers, Duration::from_secs(5));
        let session = bridge.connect(AgentType::Coder).await.unwrap();
        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "echo");
        let out = session.call_tool("echo", json!({"text": "ping"})).await.unwrap();
        assert_eq!(out, "pong");
        session.close().await;
        assert!(matches!(session.list_tools().await, Err(ToolError::Closed)));
    }
}
