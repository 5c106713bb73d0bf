//! 执行计划数据模型
//!
//! TaskPlan 由 Planner 创建，之后只有编排器（状态、重试次数）与监控（指标）修改；
//! 终态后归档而不删除。

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{ErrorClass, HiveError};

pub type StepId = String;

/// 计划状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    /// 规划中
    Planning,
    /// 已生成，等待执行
    Ready,
    /// 执行中
    Running,
    /// 已挂起
    Suspended,
    /// 全部必要步骤完成
    Completed,
    /// 失败（附原因链）
    Failed,
    /// 已取消
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

/// 单个步骤允许的最长超时（一天）
pub const MAX_STEP_TIMEOUT_SECS: u64 = 86_400;

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    /// 等待依赖满足
    Pending,
    /// 依赖已满足，正在选择 Agent / 借连接
    Dispatching,
    /// Agent 执行中
    Running,
    Completed,
    Failed,
    Cancelled,
    /// 步骤级超时（过渡状态，随后以 Failed 收尾，失败类别保留为 Timeout）
    Timeout,
    /// 依赖的可选步骤失败，未执行
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            StepStatus::Pending | StepStatus::Dispatching | StepStatus::Running | StepStatus::Timeout
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failed)
    }
}

/// 步骤失败原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub class: ErrorClass,
    pub message: String,
    /// 最后一次尝试所用的 Agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl StepFailure {
    pub fn from_error(err: &HiveError, agent_id: Option<String>) -> Self {
        Self {
            class: err.class(),
            message: err.to_string(),
            agent_id,
        }
    }
}

/// 计划级失败原因链：哪个步骤、因为什么
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFailure {
    pub step_id: StepId,
    pub cause: StepFailure,
}

/// 资源占用采样
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// 计划中的一个步骤（一次能力调用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: StepId,
    /// 顺序提示，仅在无依赖约束时影响排序
    pub order: u32,
    pub target_capability: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub depends_on: BTreeSet<StepId>,
    /// 失败时不导致计划失败（具体语义见 OptionalPolicy）
    #[serde(default)]
    pub optional: bool,
    /// 幂等：Agent 报告的失败也可重试
    #[serde(default)]
    pub idempotent: bool,
    pub timeout_seconds: u64,
    pub status: StepStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResourceUsage>,
}

impl TaskStep {
    pub fn new(id: impl Into<StepId>, capability: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            id: id.into(),
            order: 0,
            target_capability: capability.into(),
            parameters: Map::new(),
            depends_on: BTreeSet::new(),
            optional: false,
            idempotent: false,
            timeout_seconds,
            status: StepStatus::Pending,
            retry_count: 0,
            result: None,
            error: None,
            usage: None,
        }
    }

    pub fn depends_on(mut self, step: impl Into<StepId>) -> Self {
        self.depends_on.insert(step.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    /// 步骤超时，上限 [`MAX_STEP_TIMEOUT_SECS`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.min(MAX_STEP_TIMEOUT_SECS))
    }
}

/// 执行计划：步骤 DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub goal: String,
    pub steps: Vec<TaskStep>,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<PlanFailure>,
    pub created_at: DateTime<Utc>,
}

impl TaskPlan {
    pub fn new(goal: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        Self {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            goal: goal.into(),
            steps,
            status: PlanStatus::Planning,
            failure: None,
            created_at: Utc::now(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.id.as_str()).collect()
    }
}
