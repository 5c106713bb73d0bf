//! Agent 编排器：按依赖顺序遍历计划 DAG，为每个步骤选择 Agent 并派发
//!
//! - selection：封闭的排序策略集合 + 纯函数排序
//! - dispatcher：一次 CommandRequest 往返（心跳、进度、超时、取消）
//! - engine：DAG 遍历、并发限制、重试与故障转移、失败传播

pub mod dispatcher;
pub mod engine;
pub mod selection;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::resilience::RetryPolicy;

pub use dispatcher::{DispatchRequest, Dispatcher, CONTEXT_PARAMETER};
pub use engine::Orchestrator;
pub use selection::{rank, select, SelectionStrategy};

/// 可选步骤失败时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionalPolicy {
    /// 不取消兄弟步骤，计划不因此失败；其后继步骤 Skipped
    #[default]
    SuppressPlanFailure,
    /// 只是不取消兄弟步骤，计划最终仍为 Failed
    SuppressCancellationOnly,
}

/// 编排器参数
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrency_per_plan: usize,
    pub max_concurrency_per_agent: usize,
    /// 取消通知后等待 Agent 确认的宽限期
    pub cancel_grace: Duration,
    pub strategies: Vec<SelectionStrategy>,
    pub optional_policy: OptionalPolicy,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency_per_plan: 4,
            max_concurrency_per_agent: 2,
            cancel_grace: Duration::from_secs(2),
            strategies: SelectionStrategy::default_order(),
            optional_policy: OptionalPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(config: &AppConfig) -> Self {
        let section = &config.orchestrator;
        Self {
            max_concurrency_per_plan: section.max_concurrency_per_plan.max(1),
            max_concurrency_per_agent: section.max_concurrency_per_agent.max(1),
            cancel_grace: Duration::from_millis(section.cancel_grace_ms),
            strategies: if section.strategies.is_empty() {
                SelectionStrategy::default_order()
            } else {
                section.strategies.clone()
            },
            optional_policy: section.optional_policy,
            retry: RetryPolicy::from(&config.retry),
        }
    }
}
