//! Agent 选择策略
//!
//! 一组封闭的策略变体，按配置顺序逐项比较；全部相等时按注册顺序裁决，结果可复现。

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::directory::AgentSnapshot;

/// 排序策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// 健康度：Healthy > Warning > Critical
    RankByHealth,
    /// 负载：在途步骤少者优先
    RankByLoad,
    /// 历史成功率高者优先
    RankByHistory,
    /// 声明优先级高者优先
    CustomPriority,
}

impl SelectionStrategy {
    pub fn default_order() -> Vec<SelectionStrategy> {
        vec![
            SelectionStrategy::RankByHealth,
            SelectionStrategy::RankByLoad,
            SelectionStrategy::RankByHistory,
            SelectionStrategy::CustomPriority,
        ]
    }

    fn compare(&self, a: &AgentSnapshot, b: &AgentSnapshot) -> Ordering {
        match self {
            SelectionStrategy::RankByHealth => a.health.cmp(&b.health),
            SelectionStrategy::RankByLoad => a.in_flight.cmp(&b.in_flight),
            SelectionStrategy::RankByHistory => b.success_rate.total_cmp(&a.success_rate),
            SelectionStrategy::CustomPriority => b.descriptor.priority.cmp(&a.descriptor.priority),
        }
    }
}

/// 按策略排序候选 Agent（最优在前）
pub fn rank(candidates: &[AgentSnapshot], strategies: &[SelectionStrategy]) -> Vec<AgentSnapshot> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| {
        strategies
            .iter()
            .map(|s| s.compare(a, b))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
            .then(a.registration_seq.cmp(&b.registration_seq))
    });
    ranked
}

/// 选出一个 Agent；`avoid` 为上一次尝试失败的 Agent，有其他候选时跳过它
pub fn select(
    candidates: &[AgentSnapshot],
    strategies: &[SelectionStrategy],
    avoid: Option<&str>,
) -> Option<AgentSnapshot> {
    let ranked = rank(candidates, strategies);
    let preferred = ranked
        .iter()
        .position(|s| Some(s.descriptor.agent_id.as_str()) != avoid);
    match preferred {
        Some(index) => ranked.into_iter().nth(index),
        None => ranked.into_iter().next(),
    }
}
