//! 热层 → 冷存储同步
//!
//! save 只入队不等待；同一会话的待同步任务合并为最新快照（消息只追加，最新快照包含全部旧消息）。
//! 失败的任务按指数退避重新入队，超过 max_attempts 后丢弃并记录 error 日志。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StateSection;
use crate::memory::ConversationState;
use crate::state::DurableStore;

#[derive(Debug, Clone)]
struct SyncJob {
    state: ConversationState,
    attempts: u32,
    not_before: Instant,
}

#[derive(Default)]
struct QueueInner {
    jobs: HashMap<String, SyncJob>,
    order: VecDeque<String>,
}

/// 待同步会话队列（按会话 id 合并）
#[derive(Default)]
pub struct SyncQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队最新快照；已有待同步任务时直接替换快照并重置重试计数
    pub async fn enqueue(&self, state: ConversationState) {
        let id = state.conversation_id.clone();
        let job = SyncJob {
            state,
            attempts: 0,
            not_before: Instant::now(),
        };
        {
            let mut inner = self.inner.lock().await;
            if inner.jobs.insert(id.clone(), job).is_none() {
                inner.order.push_back(id);
            }
        }
        self.notify.notify_one();
    }

    /// 待同步会话数
    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 取出最多 n 个到期任务；ignore_backoff 时忽略退避时间（关闭前冲刷）
    async fn take_batch(&self, n: usize, ignore_backoff: bool) -> Vec<SyncJob> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let mut batch = Vec::new();
        let mut deferred = VecDeque::new();
        while batch.len() < n {
            let Some(id) = inner.order.pop_front() else {
                break;
            };
            let ready = inner
                .jobs
                .get(&id)
                .map(|j| ignore_backoff || j.not_before <= now)
                .unwrap_or(false);
            if ready {
                if let Some(job) = inner.jobs.remove(&id) {
                    batch.push(job);
                }
            } else if inner.jobs.contains_key(&id) {
                deferred.push_back(id);
            }
        }
        // 未到期的放回队尾，保持相对顺序
        inner.order.extend(deferred);
        batch
    }

    /// 失败任务重新入队；若期间已有更新快照则以新快照为准
    async fn requeue(&self, mut job: SyncJob, backoff: Duration) {
        let id = job.state.conversation_id.clone();
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(&id) {
            return;
        }
        job.attempts += 1;
        job.not_before = Instant::now() + backoff;
        inner.jobs.insert(id.clone(), job);
        inner.order.push_back(id);
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

/// 一批同步的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// 成功写入的会话数
    pub synced: usize,
    /// 新插入的消息行数
    pub inserted_messages: u64,
    /// 失败并重新入队的会话数
    pub retried: usize,
    /// 超过重试次数被丢弃的会话数
    pub dropped: usize,
}

impl SyncReport {
    pub fn is_empty(&self) -> bool {
        self.synced + self.retried + self.dropped == 0
    }
}

/// 后台同步 worker
#[derive(Clone)]
pub struct SyncWorker {
    queue: Arc<SyncQueue>,
    durable: Arc<dyn DurableStore>,
    batch_size: usize,
    interval: Duration,
    max_attempts: u32,
    base_backoff: Duration,
}

impl SyncWorker {
    pub fn new(queue: Arc<SyncQueue>, durable: Arc<dyn DurableStore>, section: &StateSection) -> Self {
        Self {
            queue,
            durable,
            batch_size: section.sync_batch_size.max(1),
            interval: Duration::from_millis(section.sync_interval_ms.max(1)),
            max_attempts: section.max_sync_attempts.max(1),
            base_backoff: Duration::from_millis(200),
        }
    }

    pub fn with_base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    fn backoff_for(&self, attempts: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempts.min(10))
    }

    /// 处理最多 n 个到期任务（手动触发入口，也是后台循环的一步）
    pub async fn process_batch(&self, n: usize) -> SyncReport {
        self.run_jobs(self.queue.take_batch(n, false).await).await
    }

    /// 忽略退避，处理全部待同步任务一次
    pub async fn flush(&self) -> SyncReport {
        self.run_jobs(self.queue.take_batch(usize::MAX, true).await).await
    }

    async fn run_jobs(&self, jobs: Vec<SyncJob>) -> SyncReport {
        let mut report = SyncReport::default();
        if jobs.is_empty() {
            return report;
        }
        let results = futures_util::future::join_all(jobs.into_iter().map(|job| async move {
            let result = self.durable.sync(&job.state).await;
            (job, result)
        }))
        .await;

        for (job, result) in results {
            match result {
                Ok(inserted) => {
                    report.synced += 1;
                    report.inserted_messages += inserted;
                }
                Err(e) if job.attempts + 1 < self.max_attempts => {
                    let backoff = self.backoff_for(job.attempts);
                    tracing::warn!(
                        conversation_id = %job.state.conversation_id,
                        attempt = job.attempts + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "durable sync failed, will retry: {}",
                        e
                    );
                    self.queue.requeue(job, backoff).await;
                    report.retried += 1;
                }
                Err(e) => {
                    tracing::error!(
                        conversation_id = %job.state.conversation_id,
                        attempts = job.attempts + 1,
                        "durable sync gave up: {}",
                        e
                    );
                    report.dropped += 1;
                }
            }
        }
        if report.synced > 0 {
            tracing::debug!(synced = report.synced, inserted = report.inserted_messages, "durable sync batch");
        }
        report
    }

    /// 后台循环：有新任务或到达轮询间隔时处理；取消后冲刷一次再退出
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(batch_size = self.batch_size, "sync worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.queue.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
            loop {
                let report = self.process_batch(self.batch_size).await;
                if report.synced == 0 && report.dropped == 0 {
                    break;
                }
            }
        }
        let report = self.flush().await;
        tracing::info!(synced = report.synced, "sync worker stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
