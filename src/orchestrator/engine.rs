//! 计划执行引擎
//!
//! 主循环持有依赖图：步骤完成后把新就绪的步骤放进 JoinSet，同层独立步骤并发执行，
//! 受计划级与 Agent 级 Semaphore 限制。步骤状态只在这里修改，每次变化同步给监控。
//!
//! 失败传播：
//! - 必要步骤失败：记录计划失败原因，停止接纳新步骤，尚未开始的步骤转为 Cancelled，已在执行的步骤自然结束
//! - 可选步骤失败：按 [`OptionalPolicy`] 处理，其后继步骤转为 Skipped
//! - 计划取消（ExecutionContext）：Pending 步骤立即 Cancelled，执行中的步骤通知 Agent 后在宽限期内 Cancelled
//! - 步骤超时：先经过 Timeout，再以 Failed 收尾
//!
//! 每次派发都带上会话上下文（含 scratch）；步骤完成后其结果以步骤 ID 为键写回 scratch，供后继步骤读取。

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::dispatcher::{DispatchRequest, Dispatcher};
use super::selection::select;
use super::{OptionalPolicy, OrchestratorConfig};
use crate::core::{ExecutionContext, HiveError, PlanLimiter, RecoveryAction, RecoveryEngine, TaskScheduler};
use crate::directory::{AgentDirectory, CapabilityQuery};
use crate::monitor::ExecutionMonitor;
use crate::planner::{
    PlanError, PlanFailure, PlanGraph, PlanStatus, ResourceUsage, StepFailure, StepId, StepStatus,
    TaskPlan, TaskStep,
};
use crate::pool::ConnectionPool;
use crate::resilience::{retry, BreakerRegistry};

/// 一个步骤的最终结果
struct StepReport {
    status: StepStatus,
    result: Option<Value>,
    error: Option<StepFailure>,
    attempts: u32,
    agent_id: Option<String>,
    duration_ms: u64,
}

impl StepReport {
    fn cancelled(attempts: u32, agent_id: Option<String>) -> Self {
        Self {
            status: StepStatus::Cancelled,
            result: None,
            error: None,
            attempts,
            agent_id,
            duration_ms: 0,
        }
    }
}

/// 执行中的计划：步骤状态的唯一写入点
struct PlanRun {
    plan_id: String,
    session_id: String,
    context: ExecutionContext,
    plan: Mutex<TaskPlan>,
    monitor: Arc<ExecutionMonitor>,
}

impl PlanRun {
    fn lock(&self) -> MutexGuard<'_, TaskPlan> {
        self.plan.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn step(&self, id: &str) -> Option<TaskStep> {
        self.lock().step(id).cloned()
    }

    /// 终态不可再变；返回是否发生了变化
    fn transition(&self, id: &str, status: StepStatus, agent_id: Option<&str>) -> bool {
        let snapshot = {
            let mut plan = self.lock();
            let Some(step) = plan.step_mut(id) else { return false };
            if step.status.is_terminal() || step.status == status {
                return false;
            }
            step.status = status;
            step.clone()
        };
        tracing::debug!(plan = %self.plan_id, step = %id, status = ?status, "step transition");
        self.monitor.step_status(&self.plan_id, &snapshot, agent_id);
        true
    }

    /// 进入 Dispatching；步骤已被提前终结（取消、跳过）时返回 false
    fn begin_attempt(&self, id: &str) -> bool {
        let snapshot = {
            let mut plan = self.lock();
            let Some(step) = plan.step_mut(id) else { return false };
            if step.status.is_terminal() {
                return false;
            }
            step.status = StepStatus::Dispatching;
            step.clone()
        };
        self.monitor.step_status(&self.plan_id, &snapshot, None);
        true
    }

    fn finish(&self, id: &str, report: StepReport) {
        let snapshot = {
            let mut plan = self.lock();
            let Some(step) = plan.step_mut(id) else { return };
            if step.status.is_terminal() {
                return;
            }
            step.status = report.status;
            step.result = report.result;
            step.error = report.error;
            step.retry_count = report.attempts.saturating_sub(1);
            step.usage = Some(ResourceUsage {
                duration_ms: report.duration_ms,
                attempts: report.attempts,
                agent_id: report.agent_id.clone(),
            });
            step.clone()
        };
        if self.monitor.is_anomalous(&self.plan_id, id) {
            tracing::warn!(plan = %self.plan_id, step = %id, "step finished after exceeding its expected running time");
        }
        self.monitor
            .step_status(&self.plan_id, &snapshot, report.agent_id.as_deref());
    }

    /// 将给定步骤中仍为 Pending 的转为 `status`
    fn settle_pending<'a>(&self, ids: impl IntoIterator<Item = &'a StepId>, status: StepStatus) {
        let settled: Vec<TaskStep> = {
            let mut plan = self.lock();
            ids.into_iter()
                .filter_map(|id| {
                    let step = plan.step_mut(id)?;
                    if step.status != StepStatus::Pending {
                        return None;
                    }
                    step.status = status;
                    Some(step.clone())
                })
                .collect()
        };
        for step in settled {
            tracing::debug!(plan = %self.plan_id, step = %step.id, status = ?status, "pending step settled");
            self.monitor.step_status(&self.plan_id, &step, None);
        }
    }

    fn pending_ids(&self) -> Vec<StepId> {
        self.lock()
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.id.clone())
            .collect()
    }
}

/// Agent 编排器
pub struct Orchestrator {
    config: OrchestratorConfig,
    directory: Arc<AgentDirectory>,
    breakers: Arc<BreakerRegistry>,
    scheduler: TaskScheduler,
    dispatcher: Dispatcher,
    monitor: Arc<ExecutionMonitor>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        directory: Arc<AgentDirectory>,
        breakers: Arc<BreakerRegistry>,
        pool: Arc<ConnectionPool>,
        monitor: Arc<ExecutionMonitor>,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            pool,
            Arc::clone(&directory),
            monitor.progress_reporter(),
            config.cancel_grace,
        );
        Self {
            scheduler: TaskScheduler::new(
                config.max_concurrency_per_plan,
                config.max_concurrency_per_agent,
            ),
            config,
            directory,
            breakers,
            dispatcher,
            monitor,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// 执行计划直到终态。结构非法的计划（环、悬空依赖、缺少超时）直接返回错误，不做任何派发；
    /// 执行期间的失败体现在返回计划的状态与原因链上。
    pub async fn execute(self: &Arc<Self>, mut plan: TaskPlan, context: &ExecutionContext) -> Result<TaskPlan, HiveError> {
        if plan.status.is_terminal() {
            return Err(PlanError::InvalidWorkflow(format!("plan {} already finished", plan.id)).into());
        }
        if let Some(step) = plan.steps.iter().find(|s| s.timeout_seconds == 0) {
            return Err(PlanError::MissingTimeout(step.id.clone()).into());
        }
        let mut graph = PlanGraph::new(&plan.steps)?;
        graph.levels()?;

        let order: HashMap<StepId, usize> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        let by_plan_order = |mut ids: Vec<StepId>| {
            ids.sort_by_key(|id| order.get(id).copied().unwrap_or(usize::MAX));
            ids
        };

        plan.status = PlanStatus::Running;
        self.monitor.plan_status(&plan);
        tracing::info!(plan = %plan.id, goal = %plan.goal, steps = plan.steps.len(), "plan started");

        let run = Arc::new(PlanRun {
            plan_id: plan.id.clone(),
            session_id: context.session_id().to_string(),
            context: context.clone(),
            plan: Mutex::new(plan),
            monitor: Arc::clone(&self.monitor),
        });
        let plan_token = context.cancel_token();
        // 必要步骤失败后只停止接纳新步骤，不打断执行中的步骤
        let admission = plan_token.child_token();
        let limiter = self.scheduler.plan_limiter();

        let mut tasks: JoinSet<(StepId, StepStatus)> = JoinSet::new();
        let mut failure: Option<PlanFailure> = None;
        let mut cancelled = false;

        for id in by_plan_order(graph.roots()) {
            self.spawn_step(&mut tasks, &run, id, &limiter, &plan_token, &admission);
        }

        loop {
            let joined = tokio::select! {
                _ = plan_token.cancelled(), if !cancelled => {
                    cancelled = true;
                    tracing::info!(plan = %run.plan_id, "plan cancelled");
                    run.settle_pending(run.pending_ids().iter(), StepStatus::Cancelled);
                    continue;
                }
                joined = tasks.join_next() => joined,
            };
            let Some(joined) = joined else { break };
            let (step_id, status) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(plan = %run.plan_id, "step task aborted: {}", e);
                    continue;
                }
            };

            match status {
                StepStatus::Completed => {
                    let ready = by_plan_order(graph.mark_completed(&step_id));
                    if admission.is_cancelled() {
                        run.settle_pending(ready.iter(), StepStatus::Cancelled);
                    } else {
                        for id in ready {
                            self.spawn_step(&mut tasks, &run, id, &limiter, &plan_token, &admission);
                        }
                    }
                }
                s if s.is_failure() => {
                    let Some(step) = run.step(&step_id) else { continue };
                    let descendants = graph.descendants(&step_id);
                    if step.optional {
                        tracing::warn!(plan = %run.plan_id, step = %step_id, "optional step failed, dependents skipped");
                        run.settle_pending(descendants.iter(), StepStatus::Skipped);
                        if self.config.optional_policy == OptionalPolicy::SuppressCancellationOnly
                            && failure.is_none()
                        {
                            failure = step_failure(&step);
                        }
                    } else {
                        tracing::warn!(plan = %run.plan_id, step = %step_id, "required step failed, cancelling pending steps");
                        if failure.is_none() {
                            failure = step_failure(&step);
                        }
                        admission.cancel();
                        run.settle_pending(run.pending_ids().iter(), StepStatus::Cancelled);
                    }
                }
                _ => {
                    // Cancelled / Skipped 的后继不会再就绪
                    let descendants: BTreeSet<StepId> = graph.descendants(&step_id);
                    run.settle_pending(descendants.iter(), StepStatus::Cancelled);
                }
            }
        }

        let mut plan = match Arc::try_unwrap(run) {
            Ok(run) => run.plan.into_inner().unwrap_or_else(|e| e.into_inner()),
            Err(run) => run.lock().clone(),
        };
        // 没有被执行到的步骤（例如前驱被取消）统一收尾
        for step in plan.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            step.status = StepStatus::Cancelled;
            self.monitor.step_status(&plan.id, step, None);
        }

        plan.status = if failure.is_some() {
            PlanStatus::Failed
        } else if cancelled {
            PlanStatus::Cancelled
        } else {
            PlanStatus::Completed
        };
        plan.failure = failure;
        self.monitor.plan_status(&plan);
        match &plan.failure {
            Some(f) => tracing::warn!(
                plan = %plan.id,
                step = %f.step_id,
                class = %f.cause.class,
                "plan failed: {}",
                f.cause.message
            ),
            None => tracing::info!(plan = %plan.id, status = ?plan.status, "plan finished"),
        }
        Ok(plan)
    }

    fn spawn_step(
        self: &Arc<Self>,
        tasks: &mut JoinSet<(StepId, StepStatus)>,
        run: &Arc<PlanRun>,
        step_id: StepId,
        limiter: &PlanLimiter,
        plan_token: &CancellationToken,
        admission: &CancellationToken,
    ) {
        let this = Arc::clone(self);
        let run = Arc::clone(run);
        let limiter = limiter.clone();
        let plan_token = plan_token.clone();
        let admission = admission.clone();
        tasks.spawn(async move {
            let step = AssertUnwindSafe(this.run_step(&run, &step_id, &limiter, &plan_token, &admission))
                .catch_unwind()
                .await;
            let report = match step {
                Ok(report) => report,
                Err(_) => {
                    tracing::error!(plan = %run.plan_id, step = %step_id, "step task panicked");
                    StepReport {
                        status: StepStatus::Failed,
                        result: None,
                        error: Some(StepFailure::from_error(
                            &HiveError::Internal("step task panicked".into()),
                            None,
                        )),
                        attempts: 0,
                        agent_id: None,
                        duration_ms: 0,
                    }
                }
            };
            let status = report.status;
            run.finish(&step_id, report);
            (step_id, status)
        });
    }

    async fn run_step(
        &self,
        run: &PlanRun,
        step_id: &str,
        limiter: &PlanLimiter,
        plan_token: &CancellationToken,
        admission: &CancellationToken,
    ) -> StepReport {
        let Ok(_permit) = limiter.acquire(admission).await else {
            return StepReport::cancelled(0, None);
        };
        let Some(step) = run.step(step_id) else {
            return StepReport::cancelled(0, None);
        };
        if admission.is_cancelled() || step.status.is_terminal() {
            return StepReport::cancelled(0, None);
        }

        let started = Instant::now();
        let recovery = RecoveryEngine::new();
        // 上一次尝试的 Agent 与是否应换 Agent
        let last_agent: Mutex<(Option<String>, bool)> = Mutex::new((None, false));

        let step_ref = &step;
        let last_agent_ref = &last_agent;
        let recovery_ref = &recovery;
        let outcome = retry(&self.config.retry, plan_token, step.idempotent, move |attempt| {
            let step = step_ref;
            let last_agent = last_agent_ref;
            let recovery = recovery_ref;
            async move {
                if !run.begin_attempt(&step.id) {
                    return Err(HiveError::Cancelled);
                }
                let avoid = {
                    let guard = last_agent.lock().unwrap_or_else(|e| e.into_inner());
                    if guard.1 {
                        guard.0.clone()
                    } else {
                        None
                    }
                };
                let candidates = self
                    .directory
                    .discover(&CapabilityQuery::capability(&step.target_capability))
                    .await;
                let Some(choice) = select(&candidates, &self.config.strategies, avoid.as_deref()) else {
                    return Err(HiveError::NoCapableAgent(step.target_capability.clone()));
                };
                let agent = choice.descriptor;
                tracing::debug!(
                    plan = %run.plan_id,
                    step = %step.id,
                    agent = %agent.agent_id,
                    attempt,
                    health = ?choice.health,
                    "agent selected"
                );

                let _agent_permit = self.scheduler.acquire_agent(&agent.agent_id, plan_token).await?;
                let breaker = self.breakers.get(&agent.agent_id);
                self.directory.begin_dispatch(&agent.agent_id).await;
                let context = run.context.to_json().await;
                let request = DispatchRequest {
                    dispatch_id: self.scheduler.next_dispatch_id(),
                    plan_id: &run.plan_id,
                    session_id: &run.session_id,
                    step,
                    agent: &agent,
                    attempt,
                    context: &context,
                };
                let result = breaker
                    .call(|| {
                        self.dispatcher.dispatch(request, plan_token, || {
                            run.transition(&step.id, StepStatus::Running, Some(&agent.agent_id));
                        })
                    })
                    .await;

                let verdict = match &result {
                    Ok(_) => Some(true),
                    Err(HiveError::Cancelled) | Err(HiveError::CircuitOpen(_)) => None,
                    Err(_) => Some(false),
                };
                self.directory.end_dispatch(&agent.agent_id, verdict).await;

                let failover = matches!(
                    &result,
                    Err(e) if recovery.handle(e, step.idempotent) == RecoveryAction::Failover
                );
                *last_agent.lock().unwrap_or_else(|e| e.into_inner()) =
                    (Some(agent.agent_id.clone()), failover);
                result
            }
        })
        .await;

        let agent_id = last_agent
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .0;
        let duration_ms = started.elapsed().as_millis() as u64;
        match outcome.result {
            Ok(value) => {
                run.context.set(step.id.clone(), value.clone()).await;
                StepReport {
                    status: StepStatus::Completed,
                    result: Some(value),
                    error: None,
                    attempts: outcome.attempts,
                    agent_id,
                    duration_ms,
                }
            }
            Err(HiveError::Cancelled) => StepReport {
                duration_ms,
                ..StepReport::cancelled(outcome.attempts, agent_id)
            },
            Err(err) => {
                if matches!(err, HiveError::StepTimeout(_)) {
                    run.transition(&step.id, StepStatus::Timeout, agent_id.as_deref());
                }
                tracing::warn!(
                    plan = %run.plan_id,
                    step = %step.id,
                    attempts = outcome.attempts,
                    class = %err.class(),
                    "step failed: {}",
                    err
                );
                StepReport {
                    status: StepStatus::Failed,
                    result: None,
                    error: Some(StepFailure::from_error(&err, agent_id.clone())),
                    attempts: outcome.attempts,
                    agent_id,
                    duration_ms,
                }
            }
        }
    }
}

fn step_failure(step: &TaskStep) -> Option<PlanFailure> {
    step.error.clone().map(|cause| PlanFailure {
        step_id: step.id.clone(),
        cause,
    })
}
