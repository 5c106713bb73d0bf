//! 优雅关闭
//!
//! [`ShutdownManager`] 持有进程级关闭 token：在途计划的取消信号、后台维护任务都挂在它下面。
//! 触发后由 [`ShutdownCoordinator`] 按注册顺序执行清理步骤（如关闭连接池，向 Agent 发送
//! Disconnect，子进程随之退出），单步失败或超时不影响后续步骤。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionPool;

const DEFAULT_STEP_DEADLINE: Duration = Duration::from_secs(5);

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 调用方主动关闭或 Ctrl+C
    Requested,
    /// 收到终止信号
    Signal(&'static str),
    Fatal(String),
}

/// 关闭信号：只生效一次，记录首个原因
#[derive(Debug, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发只保留第一次的原因
    pub fn trigger(&self, reason: ShutdownReason) {
        {
            let mut current = self.reason.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_some() {
                return;
            }
            tracing::info!(reason = ?reason, "shutdown triggered");
            *current = Some(reason);
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn triggered(&self) {
        self.token.cancelled().await;
    }

    /// Ctrl+C 与 SIGTERM 触发关闭
    pub fn listen_for_signals(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = manager.triggered() => {}
                res = tokio::signal::ctrl_c() => {
                    if res.is_ok() {
                        manager.trigger(ShutdownReason::Requested);
                    }
                }
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let manager = Arc::clone(self);
            tokio::spawn(async move {
                let Ok(mut sigterm) = signal(SignalKind::terminate()) else { return };
                tokio::select! {
                    _ = manager.triggered() => {}
                    _ = sigterm.recv() => manager.trigger(ShutdownReason::Signal("SIGTERM")),
                }
            });
        }
    }
}

/// 一个清理步骤
#[async_trait]
pub trait ShutdownCleanup: Send + Sync {
    fn label(&self) -> &'static str;

    async fn cleanup(&self) -> anyhow::Result<()>;
}

/// 清理结果
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub completed: Vec<&'static str>,
    /// (步骤, 原因)
    pub failed: Vec<(&'static str, String)>,
}

pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    steps: Vec<Box<dyn ShutdownCleanup>>,
    step_deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            steps: Vec::new(),
            step_deadline: DEFAULT_STEP_DEADLINE,
        }
    }

    pub fn with_step_deadline(mut self, deadline: Duration) -> Self {
        self.step_deadline = deadline;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, step: T) {
        self.steps.push(Box::new(step));
    }

    /// 确保已触发关闭，然后依次执行清理步骤
    pub async fn run_cleanup(&self) -> CleanupSummary {
        self.manager.trigger(ShutdownReason::Requested);
        let mut summary = CleanupSummary::default();
        for step in &self.steps {
            let label = step.label();
            match tokio::time::timeout(self.step_deadline, step.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::debug!(step = label, "cleanup done");
                    summary.completed.push(label);
                }
                Ok(Err(e)) => {
                    tracing::warn!(step = label, "cleanup failed: {:#}", e);
                    summary.failed.push((label, e.to_string()));
                }
                Err(_) => {
                    tracing::warn!(step = label, "cleanup exceeded {:?}", self.step_deadline);
                    summary
                        .failed
                        .push((label, format!("deadline of {:?} exceeded", self.step_deadline)));
                }
            }
        }
        tracing::info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            "shutdown cleanup finished"
        );
        summary
    }
}

/// 关闭连接池：空闲连接发送 Disconnect 后关闭，借出中的连接归还时关闭
pub struct PoolCleanup {
    pool: Arc<ConnectionPool>,
}

impl PoolCleanup {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShutdownCleanup for PoolCleanup {
    fn label(&self) -> &'static str {
        "connection-pool"
    }

    async fn cleanup(&self) -> anyhow::Result<()> {
        self.pool.close_all().await;
        Ok(())
    }
}
