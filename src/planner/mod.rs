//! 任务规划：意图 -> 步骤 DAG
//!
//! - parse_intent：声明式工作流直接解析，自由文本交给外部推理服务（带超时）
//! - generate_plan：逐步匹配目录中的能力并构建依赖图；任一能力无 Agent 提供即返回 `UnplannableIntent`
//! - optimize_plan：纯函数，按（拓扑层、顺序提示、步骤 ID）重排，同一输入总得到同一顺序

pub mod graph;
pub mod intent;
pub mod plan;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::core::ExecutionContext;
use crate::directory::{AgentDirectory, CapabilityQuery};

pub use graph::PlanGraph;
pub use intent::{
    HttpInferenceClient, InferenceClient, InferenceError, IntentModel, IntentStep,
    StaticInferenceClient,
};
pub use plan::{
    PlanFailure, PlanStatus, ResourceUsage, StepFailure, StepId, StepStatus, TaskPlan, TaskStep,
};

/// 规划错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("no registered agent provides capability '{capability}'")]
    UnplannableIntent { capability: String },

    #[error("dependency cycle among steps {0:?}")]
    CyclicDependency(Vec<StepId>),

    #[error("step {step} depends on unknown step {missing}")]
    DanglingDependency { step: StepId, missing: StepId },

    #[error("step {0} has no timeout")]
    MissingTimeout(StepId),

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// 任务规划器
pub struct Planner {
    directory: Arc<AgentDirectory>,
    inference: Arc<dyn InferenceClient>,
    inference_timeout: Duration,
}

impl Planner {
    pub fn new(
        directory: Arc<AgentDirectory>,
        inference: Arc<dyn InferenceClient>,
        inference_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            inference,
            inference_timeout,
        }
    }

    /// 文本以 `{` 开头时按声明式工作流（JSON）解析，否则调用推理服务
    pub async fn parse_intent(&self, text: &str, context: &ExecutionContext) -> Result<IntentModel, PlanError> {
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            let intent = IntentModel::from_json_str(trimmed).map_err(PlanError::InvalidWorkflow)?;
            tracing::debug!(steps = intent.steps.len(), "parsed declarative workflow");
            return Ok(intent);
        }

        let ctx = context.to_json().await;
        let intent = tokio::time::timeout(
            self.inference_timeout,
            self.inference.complete_intent(trimmed, &ctx),
        )
        .await
        .map_err(|_| InferenceError::Timeout(self.inference_timeout))??;
        tracing::info!(
            session = %context.session_id(),
            steps = intent.steps.len(),
            "intent parsed by inference service"
        );
        Ok(intent)
    }

    /// 为意图生成计划；不会触发任何派发
    pub async fn generate_plan(&self, intent: &IntentModel, _context: &ExecutionContext) -> Result<TaskPlan, PlanError> {
        if intent.steps.is_empty() {
            return Err(PlanError::InvalidWorkflow("intent has no steps".into()));
        }

        let mut steps = Vec::with_capacity(intent.steps.len());
        let mut seen = BTreeSet::new();
        for (index, hint) in intent.steps.iter().enumerate() {
            let id = if hint.id.trim().is_empty() {
                format!("step-{}", index + 1)
            } else {
                hint.id.clone()
            };
            if !seen.insert(id.clone()) {
                return Err(PlanError::InvalidWorkflow(format!("duplicate step id {id}")));
            }

            let candidates = self
                .directory
                .discover(&CapabilityQuery::capability(&hint.capability))
                .await;
            if candidates.is_empty() {
                tracing::warn!(capability = %hint.capability, "no agent satisfies capability");
                return Err(PlanError::UnplannableIntent {
                    capability: hint.capability.clone(),
                });
            }

            // 未显式指定时取候选 Agent 声明的最大超时
            let timeout_seconds = hint.timeout_seconds.unwrap_or_else(|| {
                candidates
                    .iter()
                    .filter_map(|c| c.descriptor.capability(&hint.capability))
                    .map(|c| c.timeout_seconds)
                    .max()
                    .unwrap_or(0)
            });
            if timeout_seconds == 0 {
                return Err(PlanError::MissingTimeout(id));
            }

            let mut step = TaskStep::new(id, hint.capability.clone(), timeout_seconds)
                .with_order(hint.order.unwrap_or(index as u32));
            step.parameters = hint.parameters.clone();
            step.depends_on = hint.depends_on.iter().cloned().collect();
            step.optional = hint.optional;
            step.idempotent = hint.idempotent;
            steps.push(step);
        }

        // 校验：悬空依赖与环
        PlanGraph::new(&steps)?.levels()?;

        let goal = if intent.goal.is_empty() {
            "untitled".to_string()
        } else {
            intent.goal.clone()
        };
        let mut plan = TaskPlan::new(goal, steps);
        plan.status = PlanStatus::Ready;
        tracing::info!(plan = %plan.id, steps = plan.steps.len(), "plan generated");
        Ok(plan)
    }

    pub fn optimize_plan(&self, plan: TaskPlan) -> Result<TaskPlan, PlanError> {
        optimize_plan(plan)
    }

    /// parse_intent + generate_plan + optimize_plan
    pub async fn plan(&self, text: &str, context: &ExecutionContext) -> Result<TaskPlan, PlanError> {
        let intent = self.parse_intent(text, context).await?;
        let plan = self.generate_plan(&intent, context).await?;
        optimize_plan(plan)
    }
}

/// 按拓扑层重排步骤：同层步骤互相独立、可并行，层内按（顺序提示, ID）排序
pub fn optimize_plan(mut plan: TaskPlan) -> Result<TaskPlan, PlanError> {
    let levels = PlanGraph::new(&plan.steps)?.levels()?;
    let level_of: HashMap<&str, usize> = levels
        .iter()
        .enumerate()
        .flat_map(|(level, ids)| ids.iter().map(move |id| (id.as_str(), level)))
        .collect();
    let mut keyed: Vec<(usize, u32, String, TaskStep)> = plan
        .steps
        .drain(..)
        .map(|s| (level_of.get(s.id.as_str()).copied().unwrap_or(0), s.order, s.id.clone(), s))
        .collect();
    keyed.sort_by(|a, b| (a.0, a.1, &a.2).cmp(&(b.0, b.1, &b.2)));
    plan.steps = keyed.into_iter().map(|(_, _, _, s)| s).collect();
    Ok(plan)
}
