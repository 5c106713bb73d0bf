//! 历史归档接口
//!
//! 执行报告与 Agent 目录变更交给外部持久化实现；核心侧只负责以 fire-and-forget
//! 方式投递（`tokio::spawn`），从不等待、也不因归档失败影响编排。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::directory::AgentDescriptor;
use crate::monitor::ExecutionReport;

/// 目录变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AgentChangeKind {
    Registered,
    Updated,
    Deregistered,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentChange {
    pub agent_id: String,
    pub kind: AgentChangeKind,
    pub descriptor: Option<AgentDescriptor>,
    pub at: DateTime<Utc>,
}

impl AgentChange {
    pub fn new(agent_id: &str, kind: AgentChangeKind, descriptor: Option<AgentDescriptor>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            kind,
            descriptor,
            at: Utc::now(),
        }
    }
}

/// 历史归档协作方
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record_report(&self, report: ExecutionReport);

    async fn record_agent_change(&self, change: AgentChange);
}

/// 投递执行报告，不等待结果
pub fn archive_report(sink: &Arc<dyn HistorySink>, report: ExecutionReport) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move { sink.record_report(report).await });
}

/// 投递目录变更，不等待结果
pub fn archive_agent_change(sink: &Arc<dyn HistorySink>, change: AgentChange) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move { sink.record_agent_change(change).await });
}

/// 只写日志的默认实现
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHistory;

#[async_trait]
impl HistorySink for TracingHistory {
    async fn record_report(&self, report: ExecutionReport) {
        tracing::info!(
            plan = %report.plan_id,
            status = ?report.status,
            duration_ms = report.metrics.plan_duration_ms,
            "execution report archived"
        );
    }

    async fn record_agent_change(&self, change: AgentChange) {
        tracing::info!(agent = %change.agent_id, kind = ?change.kind, "agent change archived");
    }
}

/// 内存实现（测试与嵌入式场景）
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    reports: Mutex<Vec<ExecutionReport>>,
    changes: Mutex<Vec<AgentChange>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ExecutionReport> {
        self.reports.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn changes(&self) -> Vec<AgentChange> {
        self.changes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl HistorySink for InMemoryHistory {
    async fn record_report(&self, report: ExecutionReport) {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report);
    }

    async fn record_agent_change(&self, change: AgentChange) {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(change);
    }
}
