//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM（或 REPL 输入结束）后取消后台任务，冲刷待同步的会话，再关闭连接池。

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::state::SyncWorker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 标准输入结束
    InputClosed,
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    Fatal(String),
}

/// 关闭信号：一个根 token，外加第一次触发的原因
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    /// 请求与后台 worker 都挂在它的子 token 上
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                tracing::info!(reason = ?reason, "shutdown requested");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM，任一到达即触发关闭
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                res = tokio::signal::ctrl_c() => match res {
                    Ok(()) => ShutdownReason::Interrupt,
                    Err(e) => {
                        tracing::warn!("Ctrl+C handler unavailable: {}", e);
                        return;
                    }
                },
                _ = terminate() => ShutdownReason::Terminate,
                _ = manager.wait_for_shutdown() => return,
            };
            manager.shutdown(reason);
        });
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

/// 关闭时执行的清理任务
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    fn name(&self) -> &'static str;

    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// 按注册顺序执行清理，每项单独限时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            task_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    /// 返回失败（含超时）的清理项数
    pub async fn run_cleanup(&self) -> usize {
        tracing::info!(
            tasks = self.tasks.len(),
            reason = ?self.manager.reason(),
            "running shutdown cleanup"
        );
        let mut failed = 0;
        for task in &self.tasks {
            match tokio::time::timeout(self.task_timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::debug!(task = task.name(), "cleanup done"),
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!(task = task.name(), "cleanup failed: {}", e);
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(task = task.name(), timeout = ?self.task_timeout, "cleanup timed out");
                }
            }
        }
        failed
    }
}

/// 把队列里剩余的会话快照写入冷存储
pub struct SyncFlushCleanup {
    worker: SyncWorker,
}

impl SyncFlushCleanup {
    pub fn new(worker: SyncWorker) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl ShutdownCleanup for SyncFlushCleanup {
    fn name(&self) -> &'static str {
        "sync-flush"
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        let report = self.worker.flush().await;
        let pending = report.retried + report.dropped;
        if pending > 0 {
            anyhow::bail!("{} conversations not synced ({} dropped)", pending, report.dropped);
        }
        tracing::info!(synced = report.synced, "pending conversations flushed");
        Ok(())
    }
}

pub struct PoolCleanup {
    pool: SqlitePool,
}

impl PoolCleanup {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShutdownCleanup for PoolCleanup {
    fn name(&self) -> &'static str {
        "sqlite-pool"
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// 运行 app 直到其结束或收到关闭信号，然后执行 cleanup
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();
    tokio::select! {
        _ = app => tracing::debug!("app finished"),
        _ = manager.wait_for_shutdown() => tracing::debug!("app interrupted by shutdown"),
    }
    cleanup().await;
}
