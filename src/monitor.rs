//! 执行监控：状态跟踪、超时/异常检测与执行报告
//!
//! 只观察不干预：记录步骤起止时间、计算计划耗时，运行时间超过统计阈值（均值 + k·标准差，
//! 样本不足时用配置阈值）的步骤被标记为异常，通过事件流通知编排器与外部告警。
//! 进度更新经有界通道进入，消费不过来时直接丢弃并计数，从不阻塞传输读循环。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::MonitorSection;
use crate::planner::{PlanFailure, PlanStatus, StepFailure, StepStatus, TaskPlan, TaskStep};
use crate::protocol::ProgressUpdatePayload;

/// 每个能力保留的耗时样本数
const MAX_SAMPLES: usize = 100;

/// 对外事件流
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    PlanStatusChanged {
        plan_id: String,
        status: PlanStatus,
    },
    StepStatusChanged {
        plan_id: String,
        step_id: String,
        status: StepStatus,
        agent_id: Option<String>,
    },
    Progress {
        plan_id: String,
        step_id: String,
        agent_id: String,
        percentage: u8,
        current_step: String,
    },
    Anomaly {
        plan_id: String,
        step_id: String,
        elapsed_ms: u64,
        threshold_ms: u64,
    },
}

/// Agent 上报的一条进度
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub plan_id: String,
    pub step_id: String,
    pub agent_id: String,
    pub update: ProgressUpdatePayload,
}

/// 进度上报端：`try_send`，满则丢弃
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ProgressEvent>,
    dropped: Arc<AtomicU64>,
}

impl ProgressReporter {
    /// 返回是否送达
    pub fn report(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// 单步骤执行结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub capability: String,
    pub status: StepStatus,
    pub agent_id: Option<String>,
    pub attempts: u32,
    pub duration_ms: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<StepFailure>,
    pub anomalous: bool,
}

/// 计划级指标
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionMetrics {
    pub plan_duration_ms: u64,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps_cancelled: usize,
    pub steps_skipped: usize,
    pub retries_total: u32,
    pub anomalies: Vec<String>,
    pub progress_dropped: u64,
}

/// 执行报告（交给历史归档与展示层）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub plan_id: String,
    pub goal: String,
    pub status: PlanStatus,
    pub failure: Option<PlanFailure>,
    pub steps: Vec<StepOutcome>,
    pub metrics: ExecutionMetrics,
    /// 人类可读的结果摘要
    pub summary: String,
    pub generated_at: DateTime<Utc>,
}

/// 异常检测参数
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// 阈值 = 均值 + factor * 标准差
    pub anomaly_factor: f64,
    pub min_samples: usize,
    /// 样本不足时使用的阈值
    pub default_threshold: Option<Duration>,
    pub progress_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            anomaly_factor: 3.0,
            min_samples: 5,
            default_threshold: None,
            progress_capacity: 256,
        }
    }
}

impl From<&MonitorSection> for MonitorConfig {
    fn from(section: &MonitorSection) -> Self {
        Self {
            anomaly_factor: section.anomaly_factor,
            min_samples: section.min_samples,
            default_threshold: section.default_threshold_secs.map(Duration::from_secs),
            progress_capacity: section.progress_capacity.max(1),
        }
    }
}

#[derive(Debug)]
struct StepTiming {
    capability: String,
    started: Option<Instant>,
    duration: Option<Duration>,
    agent_id: Option<String>,
}

#[derive(Debug, Default)]
struct MonitorState {
    plan_started: HashMap<String, Instant>,
    plan_duration: HashMap<String, Duration>,
    steps: HashMap<(String, String), StepTiming>,
    samples: HashMap<String, VecDeque<f64>>,
    anomalies: HashSet<(String, String)>,
}

/// 执行监控
pub struct ExecutionMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<ExecutionEvent>,
    progress_tx: mpsc::Sender<ProgressEvent>,
    progress_rx: Mutex<Option<mpsc::Receiver<ProgressEvent>>>,
    dropped: Arc<AtomicU64>,
}

impl ExecutionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(1024);
        let (progress_tx, progress_rx) = mpsc::channel(config.progress_capacity.max(1));
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            events,
            progress_tx,
            progress_rx: Mutex::new(Some(progress_rx)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ExecutionEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    pub fn progress_reporter(&self) -> ProgressReporter {
        ProgressReporter {
            tx: self.progress_tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }

    pub fn dropped_progress(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 启动进度消费任务（只能启动一次）
    pub fn spawn_progress_pump(self: &Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self
            .progress_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                let Some(event) = event else { break };
                tracing::debug!(
                    plan = %event.plan_id,
                    step = %event.step_id,
                    percentage = event.update.percentage,
                    "progress: {}",
                    event.update.current_step
                );
                monitor.emit(ExecutionEvent::Progress {
                    plan_id: event.plan_id,
                    step_id: event.step_id,
                    agent_id: event.agent_id,
                    percentage: event.update.percentage,
                    current_step: event.update.current_step,
                });
            }
        });
    }

    pub fn plan_status(&self, plan: &TaskPlan) {
        {
            let mut state = self.lock();
            match plan.status {
                PlanStatus::Running => {
                    state.plan_started.entry(plan.id.clone()).or_insert_with(Instant::now);
                }
                s if s.is_terminal() => {
                    if let Some(started) = state.plan_started.get(&plan.id).copied() {
                        state.plan_duration.insert(plan.id.clone(), started.elapsed());
                    }
                }
                _ => {}
            }
        }
        self.emit(ExecutionEvent::PlanStatusChanged {
            plan_id: plan.id.clone(),
            status: plan.status,
        });
    }

    /// 记录步骤状态变化（Running 开始计时，终态结束计时）
    pub fn step_status(&self, plan_id: &str, step: &TaskStep, agent_id: Option<&str>) {
        let key = (plan_id.to_string(), step.id.clone());
        let mut late_anomaly = None;
        {
            let mut state = self.lock();
            let timing = state.steps.entry(key.clone()).or_insert_with(|| StepTiming {
                capability: step.target_capability.clone(),
                started: None,
                duration: None,
                agent_id: None,
            });
            if let Some(agent) = agent_id {
                timing.agent_id = Some(agent.to_string());
            }
            let mut finished = None;
            match step.status {
                StepStatus::Running => {
                    if timing.started.is_none() {
                        timing.started = Some(Instant::now());
                    }
                }
                s if s.is_terminal() => {
                    if let Some(started) = timing.started {
                        let elapsed = started.elapsed();
                        timing.duration = Some(elapsed);
                        finished = Some((s, elapsed));
                    }
                }
                _ => {}
            }

            if let Some((status, elapsed)) = finished {
                let capability = step.target_capability.clone();
                if let Some(threshold) = self.threshold(&state, &capability) {
                    if elapsed > threshold && state.anomalies.insert(key.clone()) {
                        late_anomaly = Some((elapsed, threshold));
                    }
                }
                if status == StepStatus::Completed {
                    let samples = state.samples.entry(capability).or_default();
                    samples.push_back(elapsed.as_secs_f64());
                    if samples.len() > MAX_SAMPLES {
                        samples.pop_front();
                    }
                }
            }
        }

        if let Some((elapsed, threshold)) = late_anomaly {
            self.raise_anomaly(plan_id, &step.id, elapsed, threshold);
        }
        self.emit(ExecutionEvent::StepStatusChanged {
            plan_id: plan_id.to_string(),
            step_id: step.id.clone(),
            status: step.status,
            agent_id: agent_id.map(str::to_string),
        });
    }

    fn threshold(&self, state: &MonitorState, capability: &str) -> Option<Duration> {
        let samples = state.samples.get(capability);
        match samples {
            Some(s) if s.len() >= self.config.min_samples.max(2) => {
                let n = s.len() as f64;
                let mean = s.iter().sum::<f64>() / n;
                let variance = s.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
                let limit = mean + self.config.anomaly_factor * variance.sqrt();
                // 方差为 0 时给出最小余量
                Some(Duration::from_secs_f64(limit.max(mean * 1.5).max(0.001)))
            }
            _ => self.config.default_threshold,
        }
    }

    fn raise_anomaly(&self, plan_id: &str, step_id: &str, elapsed: Duration, threshold: Duration) {
        tracing::warn!(
            plan = %plan_id,
            step = %step_id,
            elapsed_ms = elapsed.as_millis() as u64,
            threshold_ms = threshold.as_millis() as u64,
            "step running time anomaly"
        );
        self.emit(ExecutionEvent::Anomaly {
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            threshold_ms: threshold.as_millis() as u64,
        });
    }

    /// 扫描运行中的步骤，返回本次新标记的异常 (plan_id, step_id)
    pub fn scan(&self) -> Vec<(String, String)> {
        let mut flagged = Vec::new();
        {
            let mut state = self.lock();
            let running: Vec<((String, String), String, Duration)> = state
                .steps
                .iter()
                .filter(|(key, t)| t.duration.is_none() && !state.anomalies.contains(*key))
                .filter_map(|(key, t)| t.started.map(|s| (key.clone(), t.capability.clone(), s.elapsed())))
                .collect();
            for (key, capability, elapsed) in running {
                if let Some(threshold) = self.threshold(&state, &capability) {
                    if elapsed > threshold {
                        state.anomalies.insert(key.clone());
                        flagged.push((key, elapsed, threshold));
                    }
                }
            }
        }
        flagged
            .into_iter()
            .map(|((plan_id, step_id), elapsed, threshold)| {
                self.raise_anomaly(&plan_id, &step_id, elapsed, threshold);
                (plan_id, step_id)
            })
            .collect()
    }

    pub fn is_anomalous(&self, plan_id: &str, step_id: &str) -> bool {
        self.lock()
            .anomalies
            .contains(&(plan_id.to_string(), step_id.to_string()))
    }

    /// 生成执行报告
    pub fn report(&self, plan: &TaskPlan) -> ExecutionReport {
        let state = self.lock();
        let plan_duration = state
            .plan_duration
            .get(&plan.id)
            .copied()
            .or_else(|| state.plan_started.get(&plan.id).map(|s| s.elapsed()))
            .unwrap_or_default();

        let mut metrics = ExecutionMetrics {
            plan_duration_ms: plan_duration.as_millis() as u64,
            steps_total: plan.steps.len(),
            progress_dropped: self.dropped_progress(),
            ..ExecutionMetrics::default()
        };
        let steps: Vec<StepOutcome> = plan
            .steps
            .iter()
            .map(|step| {
                let key = (plan.id.clone(), step.id.clone());
                let timing = state.steps.get(&key);
                let anomalous = state.anomalies.contains(&key);
                match step.status {
                    StepStatus::Completed => metrics.steps_completed += 1,
                    StepStatus::Failed => metrics.steps_failed += 1,
                    StepStatus::Cancelled => metrics.steps_cancelled += 1,
                    StepStatus::Skipped => metrics.steps_skipped += 1,
                    _ => {}
                }
                metrics.retries_total += step.retry_count;
                if anomalous {
                    metrics.anomalies.push(step.id.clone());
                }
                StepOutcome {
                    step_id: step.id.clone(),
                    capability: step.target_capability.clone(),
                    status: step.status,
                    agent_id: step
                        .usage
                        .as_ref()
                        .and_then(|u| u.agent_id.clone())
                        .or_else(|| timing.and_then(|t| t.agent_id.clone())),
                    attempts: step.usage.as_ref().map(|u| u.attempts).unwrap_or(0),
                    duration_ms: timing.and_then(|t| t.duration).map(|d| d.as_millis() as u64),
                    result: step.result.clone(),
                    error: step.error.clone(),
                    anomalous,
                }
            })
            .collect();

        ExecutionReport {
            plan_id: plan.id.clone(),
            goal: plan.goal.clone(),
            status: plan.status,
            failure: plan.failure.clone(),
            summary: summarize(plan, &metrics),
            steps,
            metrics,
            generated_at: Utc::now(),
        }
    }

    /// 计划归档后释放其计时数据（能力样本保留）
    pub fn forget(&self, plan_id: &str) {
        let mut state = self.lock();
        state.plan_started.remove(plan_id);
        state.plan_duration.remove(plan_id);
        state.steps.retain(|(p, _), _| p != plan_id);
        state.anomalies.retain(|(p, _)| p != plan_id);
    }
}

fn summarize(plan: &TaskPlan, m: &ExecutionMetrics) -> String {
    let head = match plan.status {
        PlanStatus::Completed => format!("'{}' completed", plan.goal),
        PlanStatus::Failed => match &plan.failure {
            Some(f) => format!(
                "'{}' failed at step {} ({}: {})",
                plan.goal, f.step_id, f.cause.class, f.cause.message
            ),
            None => format!("'{}' failed", plan.goal),
        },
        PlanStatus::Cancelled => format!("'{}' was cancelled", plan.goal),
        other => format!("'{}' is {:?}", plan.goal, other),
    };
    format!(
        "{}: {}/{} steps completed, {} failed, {} cancelled, {} skipped in {} ms",
        head,
        m.steps_completed,
        m.steps_total,
        m.steps_failed,
        m.steps_cancelled,
        m.steps_skipped,
        m.plan_duration_ms
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(step: &TaskStep) -> TaskStep {
        let mut s = step.clone();
        s.status = StepStatus::Running;
        s
    }

    fn with_status(step: &TaskStep, status: StepStatus) -> TaskStep {
        let mut s = step.clone();
        s.status = status;
        s
    }

    #[tokio::test(start_paused = true)]
    async fn test_statistical_anomaly() {
        let monitor = ExecutionMonitor::new(MonitorConfig {
            min_samples: 3,
            ..MonitorConfig::default()
        });
        let step = TaskStep::new("s", "SendEmail", 30);
        for i in 0..3 {
            let plan = format!("p{i}");
            monitor.step_status(&plan, &running(&step), Some("a"));
            tokio::time::advance(Duration::from_millis(100)).await;
            monitor.step_status(&plan, &with_status(&step, StepStatus::Completed), Some("a"));
        }

        let mut events = monitor.subscribe();
        monitor.step_status("slow", &running(&step), Some("a"));
        tokio::time::advance(Duration::from_millis(120)).await;
        assert!(monitor.scan().is_empty());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(monitor.scan(), vec![("slow".to_string(), "s".to_string())]);
        assert!(monitor.is_anomalous("slow", "s"));
        // 只标记一次
        assert!(monitor.scan().is_empty());

        let mut saw_anomaly = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ExecutionEvent::Anomaly { .. }) {
                saw_anomaly = true;
            }
        }
        assert!(saw_anomaly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_threshold_without_samples() {
        let monitor = ExecutionMonitor::new(MonitorConfig {
            default_threshold: Some(Duration::from_secs(2)),
            ..MonitorConfig::default()
        });
        let step = TaskStep::new("s", "Render", 30);
        monitor.step_status("p", &running(&step), None);
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(monitor.scan().len(), 1);
    }

    #[test]
    fn test_progress_overflow_is_dropped() {
        let monitor = ExecutionMonitor::new(MonitorConfig {
            progress_capacity: 1,
            ..MonitorConfig::default()
        });
        let reporter = monitor.progress_reporter();
        let event = ProgressEvent {
            plan_id: "p".into(),
            step_id: "s".into(),
            agent_id: "a".into(),
            update: ProgressUpdatePayload {
                execution_id: "e".into(),
                percentage: 10,
                current_step: "x".into(),
                intermediate_results: None,
            },
        };
        assert!(reporter.report(event.clone()));
        assert!(!reporter.report(event));
        assert_eq!(monitor.dropped_progress(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_metrics() {
        let monitor = ExecutionMonitor::new(MonitorConfig::default());
        let mut plan = TaskPlan::new(
            "demo",
            vec![TaskStep::new("a", "X", 5), TaskStep::new("b", "Y", 5).depends_on("a")],
        );
        plan.status = PlanStatus::Running;
        monitor.plan_status(&plan);
        monitor.step_status(&plan.id, &running(&plan.steps[0]), Some("w"));
        tokio::time::advance(Duration::from_millis(50)).await;
        plan.steps[0].status = StepStatus::Completed;
        monitor.step_status(&plan.id, &plan.steps[0], Some("w"));
        plan.steps[1].status = StepStatus::Cancelled;
        plan.status = PlanStatus::Cancelled;
        monitor.plan_status(&plan);

        let report = monitor.report(&plan);
        assert_eq!(report.metrics.steps_completed, 1);
        assert_eq!(report.metrics.steps_cancelled, 1);
        assert_eq!(report.steps[0].duration_ms, Some(50));
        assert_eq!(report.steps[0].agent_id.as_deref(), Some("w"));
        assert!(report.summary.contains("cancelled"));
    }
}
