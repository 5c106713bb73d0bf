//! 任务调度：计划内并发与单 Agent 并发限制
//!
//! 每个计划一个 Semaphore（max_concurrency_per_plan），每个 Agent 一个全局 Semaphore
//! （max_concurrency_per_agent）。步骤先拿计划许可，选定 Agent 后再拿 Agent 许可。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;

/// 调度 ID（由 [`TaskScheduler`] 按派发顺序分配，同一调度器内唯一）
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DispatchId(u64);

impl DispatchId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// 计划级并发限制
#[derive(Debug, Clone)]
pub struct PlanLimiter {
    semaphore: Arc<Semaphore>,
}

impl PlanLimiter {
    /// 等待计划许可；计划取消时返回 `Cancelled`
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, HiveError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(HiveError::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => {
                permit.map_err(|_| HiveError::Internal("plan limiter closed".into()))
            }
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// 任务调度器
pub struct TaskScheduler {
    max_per_plan: usize,
    max_per_agent: usize,
    agents: Mutex<HashMap<String, Arc<Semaphore>>>,
    next_dispatch: AtomicU64,
}

impl TaskScheduler {
    pub fn new(max_per_plan: usize, max_per_agent: usize) -> Self {
        Self {
            max_per_plan: max_per_plan.max(1),
            max_per_agent: max_per_agent.max(1),
            agents: Mutex::new(HashMap::new()),
            next_dispatch: AtomicU64::new(0),
        }
    }

    pub fn next_dispatch_id(&self) -> DispatchId {
        DispatchId(self.next_dispatch.fetch_add(1, Ordering::Relaxed))
    }

    pub fn plan_limiter(&self) -> PlanLimiter {
        PlanLimiter {
            semaphore: Arc::new(Semaphore::new(self.max_per_plan)),
        }
    }

    fn agent_semaphore(&self, agent_id: &str) -> Arc<Semaphore> {
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            agents
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_agent))),
        )
    }

    /// 获取 Agent 执行许可
    pub async fn acquire_agent(
        &self,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, HiveError> {
        let semaphore = self.agent_semaphore(agent_id);
        tokio::select! {
            _ = cancel.cancelled() => Err(HiveError::Cancelled),
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| HiveError::Internal("agent limiter closed".into()))
            }
        }
    }

    /// Agent 当前剩余许可数
    pub fn agent_available(&self, agent_id: &str) -> usize {
        self.agent_semaphore(agent_id).available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_limit() {
        let scheduler = TaskScheduler::new(4, 1);
        let cancel = CancellationToken::new();
        let first = scheduler.acquire_agent("a", &cancel).await.unwrap();
        assert_eq!(scheduler.agent_available("a"), 0);
        assert_eq!(scheduler.agent_available("b"), 1);
        drop(first);
        assert_eq!(scheduler.agent_available("a"), 1);
    }

    #[tokio::test]
    async fn test_plan_limit_cancelled_while_waiting() {
        let scheduler = TaskScheduler::new(1, 1);
        let limiter = scheduler.plan_limiter();
        let cancel = CancellationToken::new();
        let _held = limiter.acquire(&cancel).await.unwrap();
        cancel.cancel();
        assert_eq!(limiter.acquire(&cancel).await.err(), Some(HiveError::Cancelled));
    }

    #[test]
    fn test_dispatch_ids_are_per_scheduler() {
        let first = TaskScheduler::default();
        let second = TaskScheduler::default();
        let a = first.next_dispatch_id();
        let b = first.next_dispatch_id();
        assert_ne!(a, b);
        assert_eq!((a.value(), b.value()), (0, 1));
        assert_eq!(second.next_dispatch_id().value(), 0);
    }
}
