//! Squad 命令行入口
//!
//! 从标准输入逐行读取请求，每行一个回合，回复以 JSON 输出到标准输出。
//! 行格式：`agent> message`（如 `analyst> 上季度收入如何`），省略 `agent>` 时自动选择。
//! 第一个参数可指定配置文件路径。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use squad::agents::AgentType;
use squad::config::load_config;
use squad::core::{
    run_with_graceful_shutdown, AgentRequest, OrchestratorBuilder, PoolCleanup, Runtime,
    ShutdownCoordinator, ShutdownManager, ShutdownReason, SyncFlushCleanup,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 解析 `agent> message`；前缀不是已知 Agent 时整行视为消息
fn parse_line(line: &str) -> (Option<AgentType>, &str) {
    if let Some((head, rest)) = line.split_once('>') {
        if let Ok(agent) = head.parse::<AgentType>() {
            return (Some(agent), rest.trim());
        }
    }
    (None, line.trim())
}

async fn repl(runtime: Arc<Runtime>, shutdown: Arc<ShutdownManager>) {
    let conversation_id = uuid::Uuid::new_v4().to_string();
    let user_id = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
    tracing::info!(conversation_id = %conversation_id, "conversation started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("stdin read failed: {}", e);
                break;
            }
        };
        let (agent, message) = parse_line(&line);
        if message.is_empty() {
            continue;
        }

        let mut request = AgentRequest::new(&conversation_id, &user_id, message);
        request.agent_type = agent;
        match runtime
            .orchestrator
            .process(request, shutdown.token().child_token())
            .await
        {
            Ok(response) => match serde_json::to_string_pretty(&response) {
                Ok(json) => println!("{}", json),
                Err(e) => tracing::error!("response encoding failed: {}", e),
            },
            Err(e) => {
                tracing::error!(retryable = e.is_retryable(), "turn failed: {}", e);
                println!("{}", serde_json::json!({ "error": e.to_string() }));
            }
        }
    }
    shutdown.shutdown(ShutdownReason::InputClosed);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖；输出到 stderr，stdout 只留给回复
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let runtime = Arc::new(
        OrchestratorBuilder::new(cfg)
            .build()
            .await
            .context("Failed to build orchestrator")?,
    );

    let shutdown = Arc::new(ShutdownManager::new());
    let worker = runtime.spawn_sync_worker(shutdown.token().child_token());
    let sweeper = runtime.spawn_sweeper(shutdown.token().child_token());

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(SyncFlushCleanup::new(runtime.sync_worker()));
    coordinator.register(PoolCleanup::new(runtime.pool.clone()));

    let app = repl(runtime.clone(), shutdown.clone());
    run_with_graceful_shutdown(shutdown.clone(), app, move || async move {
        shutdown.shutdown(ShutdownReason::InputClosed);
        if let Err(e) = worker.await {
            tracing::warn!("sync worker join failed: {}", e);
        }
        if let Err(e) = sweeper.await {
            tracing::warn!("cache sweeper join failed: {}", e);
        }
        coordinator.run_cleanup().await;
    })
    .await;

    Ok(())
}
