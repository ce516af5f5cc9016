//! Squad HTTP 入口
//!
//! 启动: cargo run --bin squad-web --features web
//! 监听地址由 SQUAD_WEB_ADDR 指定，默认 127.0.0.1:8080

#![cfg(feature = "web")]

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use squad::agents::AgentType;
use squad::config::load_config;
use squad::core::{
    AgentRequest, OrchestratorBuilder, PoolCleanup, Runtime, ShutdownCoordinator, ShutdownManager,
    SyncFlushCleanup,
};
use squad::knowledge::{KnowledgeError, KnowledgeQuery, NewKnowledgeEntry};

type ApiError = (StatusCode, Json<Value>);

struct AppState {
    runtime: Arc<Runtime>,
    shutdown: Arc<ShutdownManager>,
}

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "success": false, "error": message.into() })))
}

/// 聊天回复（needsReview / reviewReason 与旧前端字段保持一致）
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatData {
    message: String,
    confidence: u8,
    verified: bool,
    needs_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    review_reason: Option<String>,
    severity: String,
    warnings: Vec<String>,
}

async fn api_chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AgentRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.conversation_id.trim().is_empty() || req.user_id.trim().is_empty() || req.message.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "Missing required fields"));
    }

    let cancel = state.shutdown.token().child_token();
    let response = state
        .runtime
        .orchestrator
        .process(req, cancel)
        .await
        .map_err(|e| {
            tracing::error!(retryable = e.is_retryable(), "chat request failed: {}", e);
            let status = if e.is_retryable() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            error(status, e.to_string())
        })?;

    let data = ChatData {
        message: response.message,
        confidence: response.confidence,
        verified: response.verified,
        needs_review: response.escalated,
        review_reason: response.escalation_reason,
        severity: response.severity.to_string(),
        warnings: response.warnings,
    };
    Ok(Json(json!({
        "success": true,
        "data": data,
        "metadata": response.metadata,
    })))
}

async fn api_knowledge_add(
    State(state): State<Arc<AppState>>,
    Json(entry): Json<NewKnowledgeEntry>,
) -> Result<Json<Value>, ApiError> {
    if entry.category.trim().is_empty() || entry.key.trim().is_empty() || entry.value.trim().is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "category, key and value are required"));
    }
    match state.runtime.knowledge.add(entry).await {
        Ok(created) => Ok(Json(json!({ "success": true, "data": created }))),
        Err(e @ KnowledgeError::UnauthorizedSource { .. }) => Err(error(StatusCode::FORBIDDEN, e.to_string())),
        Err(e) => {
            tracing::error!("knowledge add failed: {}", e);
            Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

async fn api_knowledge_query(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
    Query(query): Query<KnowledgeQuery>,
) -> Result<Json<Value>, ApiError> {
    let agent: AgentType = agent.parse().map_err(|e: String| error(StatusCode::BAD_REQUEST, e))?;
    let entries = state.runtime.knowledge.query(agent, &query).await;
    Ok(Json(json!({ "success": true, "data": entries })))
}

async fn api_knowledge_stats(
    State(state): State<Arc<AppState>>,
    Path(agent): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let agent: AgentType = agent.parse().map_err(|e: String| error(StatusCode::BAD_REQUEST, e))?;
    let knowledge = &state.runtime.knowledge;
    Ok(Json(json!({
        "success": true,
        "data": {
            "stats": knowledge.stats(agent).await,
            "categories": knowledge.categories(agent).await,
        }
    })))
}

async fn api_sync(State(state): State<Arc<AppState>>) -> Json<Value> {
    let batch = state.runtime.config.state.sync_batch_size;
    let report = state.runtime.sync_worker().process_batch(batch).await;
    Json(json!({ "success": true, "report": report }))
}

#[derive(Deserialize)]
struct RecentParams {
    #[serde(default = "default_recent_limit")]
    limit: usize,
}

fn default_recent_limit() -> usize {
    20
}

async fn api_conversations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(params): Query<RecentParams>,
) -> Result<Json<Value>, ApiError> {
    let list = state
        .runtime
        .state
        .recent_conversations(&user_id, params.limit)
        .await
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(json!({ "success": true, "data": list })))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).context("Failed to load config")?;
    let runtime = Arc::new(
        OrchestratorBuilder::new(cfg)
            .build()
            .await
            .context("Failed to build orchestrator")?,
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let worker = runtime.spawn_sync_worker(shutdown.token().child_token());
    let sweeper = runtime.spawn_sweeper(shutdown.token().child_token());

    let state = Arc::new(AppState {
        runtime: runtime.clone(),
        shutdown: shutdown.clone(),
    });

    let app = Router::new()
        .route("/api/health", get(|| async { "OK" }))
        .route("/api/chat", post(api_chat))
        .route("/api/knowledge", post(api_knowledge_add))
        .route("/api/knowledge/:agent", get(api_knowledge_query))
        .route("/api/knowledge/:agent/stats", get(api_knowledge_stats))
        .route("/api/conversations/:user_id", get(api_conversations))
        .route("/api/sync", get(api_sync))
        .with_state(state);

    let addr = std::env::var("SQUAD_WEB_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Squad web listening on http://{}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { signal.wait_for_shutdown().await })
        .await
        .context("Server error")?;

    if let Err(e) = worker.await {
        tracing::warn!("sync worker join failed: {}", e);
    }
    if let Err(e) = sweeper.await {
        tracing::warn!("cache sweeper join failed: {}", e);
    }
    let mut coordinator = ShutdownCoordinator::new(shutdown);
    coordinator.register(SyncFlushCleanup::new(runtime.sync_worker()));
    coordinator.register(PoolCleanup::new(runtime.pool.clone()));
    coordinator.run_cleanup().await;
    Ok(())
}
