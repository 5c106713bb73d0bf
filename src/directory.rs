//! Agent 目录：能力注册、发现与健康状态
//!
//! 进程内唯一的共享可变状态之一，内部用 RwLock 串行化写入、允许并发发现。
//! 健康度由心跳新鲜度与熔断器状态共同推导；连续错过 N 次心跳的 Agent 转为 Offline，
//! 在重新注册前不会出现在发现结果中。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::DirectorySection;
use crate::history::{archive_agent_change, AgentChange, AgentChangeKind, HistorySink};
use crate::protocol::{AgentStatus, AgentType, Capability, HeartbeatPayload, RegistrationPayload};
use crate::resilience::{BreakerRegistry, BreakerState};
use crate::transport::TransportConfig;

/// Agent 描述（注册时创建，心跳时更新，断开或心跳过期时移除）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    pub agent_type: AgentType,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub transport: TransportConfig,
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<String>,
    /// 声明优先级，越大越优先
    #[serde(default)]
    pub priority: i32,
}

fn default_supported_versions() -> Vec<String> {
    vec![crate::protocol::PROTOCOL_VERSION.to_string()]
}

impl AgentDescriptor {
    pub fn new(agent_id: impl Into<String>, agent_type: AgentType, transport: TransportConfig) -> Self {
        let agent_id = agent_id.into();
        Self {
            name: agent_id.clone(),
            agent_id,
            version: "0.1.0".to_string(),
            agent_type,
            capabilities: Vec::new(),
            transport,
            supported_versions: default_supported_versions(),
            priority: 0,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// 由握手阶段收到的 Registration 构造，传输配置沿用已知配置
    pub fn from_registration(payload: &RegistrationPayload, transport: TransportConfig, priority: i32) -> Self {
        Self {
            agent_id: payload.agent_id.clone(),
            name: payload.name.clone(),
            version: payload.version.clone(),
            agent_type: payload.agent_type,
            capabilities: payload.capabilities.clone(),
            transport,
            supported_versions: payload.supported_versions.clone(),
            priority,
        }
    }

    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }
}

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Warning,
    Critical,
    Offline,
}

/// 目录错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DirectoryError {
    #[error("agent {0} already registered with different capabilities")]
    DuplicateAgent(String),

    #[error("unknown agent {0}")]
    UnknownAgent(String),

    #[error("agent {0} is offline and must re-register")]
    AgentOffline(String),

    #[error("capability {capability} of agent {agent_id} declares no timeout")]
    MissingTimeout { agent_id: String, capability: String },

    #[error("invalid agent descriptor: {0}")]
    InvalidDescriptor(String),
}

/// 发现条件
#[derive(Debug, Clone, Default)]
pub struct CapabilityQuery {
    pub capability: String,
    pub agent_type: Option<AgentType>,
}

impl CapabilityQuery {
    pub fn capability(name: impl Into<String>) -> Self {
        Self {
            capability: name.into(),
            agent_type: None,
        }
    }
}

/// 发现结果：描述 + 选择所需的运行时数据
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub descriptor: AgentDescriptor,
    pub health: HealthState,
    /// 在途步骤数
    pub in_flight: u32,
    pub success_rate: f64,
    /// 注册顺序，用于稳定的并列裁决
    pub registration_seq: u64,
    pub reported_status: Option<AgentStatus>,
}

#[derive(Debug)]
struct AgentRecord {
    descriptor: AgentDescriptor,
    seq: u64,
    /// 首次握手或心跳后才开始计算心跳新鲜度
    last_seen: Option<Instant>,
    reported_status: Option<AgentStatus>,
    active_task_count: u32,
    offline: bool,
    in_flight: u32,
    successes: u64,
    failures: u64,
}

impl AgentRecord {
    fn success_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    agents: HashMap<String, AgentRecord>,
    next_seq: u64,
}

/// Agent 目录
pub struct AgentDirectory {
    state: RwLock<DirectoryState>,
    breakers: Arc<BreakerRegistry>,
    history: Arc<dyn HistorySink>,
    heartbeat_interval: Duration,
    missed_heartbeat_limit: u32,
}

fn derive_health(
    record: &AgentRecord,
    breaker: BreakerState,
    now: Instant,
    interval: Duration,
) -> HealthState {
    if record.offline {
        return HealthState::Offline;
    }
    let mut health = match breaker {
        BreakerState::Open => HealthState::Critical,
        BreakerState::HalfOpen => HealthState::Warning,
        BreakerState::Closed => HealthState::Healthy,
    };
    let reported = match record.reported_status {
        Some(AgentStatus::Error) => HealthState::Critical,
        Some(AgentStatus::Maintenance) => HealthState::Warning,
        _ => HealthState::Healthy,
    };
    health = health.max(reported);
    if let Some(seen) = record.last_seen {
        if now.duration_since(seen) > interval {
            health = health.max(HealthState::Warning);
        }
    }
    health
}

fn validate(descriptor: &AgentDescriptor) -> Result<(), DirectoryError> {
    if descriptor.agent_id.trim().is_empty() {
        return Err(DirectoryError::InvalidDescriptor("empty agent id".into()));
    }
    if let Some(cap) = descriptor.capabilities.iter().find(|c| c.timeout_seconds == 0) {
        return Err(DirectoryError::MissingTimeout {
            agent_id: descriptor.agent_id.clone(),
            capability: cap.name.clone(),
        });
    }
    Ok(())
}

impl AgentDirectory {
    pub fn new(
        config: &DirectorySection,
        breakers: Arc<BreakerRegistry>,
        history: Arc<dyn HistorySink>,
    ) -> Self {
        Self {
            state: RwLock::new(DirectoryState::default()),
            breakers,
            history,
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs.max(1)),
            missed_heartbeat_limit: config.missed_heartbeat_limit.max(1),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// 注册；在线 Agent 同 ID 重复注册仅在能力完全一致时允许（视为更新，保留注册顺序）。
    /// 已下线的 Agent 重新注册时以新的描述替换旧的，能力可以不同。
    pub async fn register(&self, descriptor: AgentDescriptor) -> Result<(), DirectoryError> {
        validate(&descriptor)?;
        let agent_id = descriptor.agent_id.clone();
        let kind = {
            let mut state = self.state.write().await;
            if let Some(existing) = state.agents.get_mut(&agent_id) {
                if !existing.offline && existing.descriptor.capabilities != descriptor.capabilities {
                    return Err(DirectoryError::DuplicateAgent(agent_id));
                }
                existing.descriptor = descriptor.clone();
                existing.offline = false;
                if existing.last_seen.is_some() {
                    existing.last_seen = Some(Instant::now());
                }
                AgentChangeKind::Updated
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.agents.insert(
                    agent_id.clone(),
                    AgentRecord {
                        descriptor: descriptor.clone(),
                        seq,
                        last_seen: None,
                        reported_status: None,
                        active_task_count: 0,
                        offline: false,
                        in_flight: 0,
                        successes: 0,
                        failures: 0,
                    },
                );
                AgentChangeKind::Registered
            }
        };
        tracing::info!(
            agent = %agent_id,
            capabilities = descriptor.capabilities.len(),
            "agent {:?}",
            kind
        );
        archive_agent_change(&self.history, AgentChange::new(&agent_id, kind, Some(descriptor)));
        Ok(())
    }

    /// 标记 Agent 在线（握手完成），开始心跳计时
    pub async fn mark_alive(&self, agent_id: &str) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        let record = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| DirectoryError::UnknownAgent(agent_id.to_string()))?;
        record.last_seen = Some(Instant::now());
        record.offline = false;
        Ok(())
    }

    /// 按能力发现，排除 Offline，结果按注册顺序排列
    pub async fn discover(&self, query: &CapabilityQuery) -> Vec<AgentSnapshot> {
        let state = self.state.read().await;
        let now = Instant::now();
        let mut found: Vec<AgentSnapshot> = state
            .agents
            .values()
            .filter(|r| r.descriptor.capability(&query.capability).is_some())
            .filter(|r| query.agent_type.map_or(true, |t| t == r.descriptor.agent_type))
            .map(|r| self.snapshot(r, now))
            .filter(|s| s.health != HealthState::Offline)
            .collect();
        found.sort_by_key(|s| s.registration_seq);
        found
    }

    fn snapshot(&self, record: &AgentRecord, now: Instant) -> AgentSnapshot {
        let breaker = self.breakers.state(&record.descriptor.agent_id);
        AgentSnapshot {
            descriptor: record.descriptor.clone(),
            health: derive_health(record, breaker, now, self.heartbeat_interval),
            in_flight: record.in_flight.max(record.active_task_count),
            success_rate: record.success_rate(),
            registration_seq: record.seq,
            reported_status: record.reported_status,
        }
    }

    pub async fn heartbeat(&self, agent_id: &str, heartbeat: &HeartbeatPayload) -> Result<(), DirectoryError> {
        let mut state = self.state.write().await;
        let record = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| DirectoryError::UnknownAgent(agent_id.to_string()))?;
        if record.offline {
            return Err(DirectoryError::AgentOffline(agent_id.to_string()));
        }
        record.last_seen = Some(Instant::now());
        record.reported_status = Some(heartbeat.agent_status);
        record.active_task_count = heartbeat.active_task_count;
        tracing::debug!(
            agent = %agent_id,
            status = ?heartbeat.agent_status,
            active = heartbeat.active_task_count,
            "heartbeat"
        );
        Ok(())
    }

    pub async fn deregister(&self, agent_id: &str) -> Result<AgentDescriptor, DirectoryError> {
        let record = self
            .state
            .write()
            .await
            .agents
            .remove(agent_id)
            .ok_or_else(|| DirectoryError::UnknownAgent(agent_id.to_string()))?;
        self.breakers.remove(agent_id);
        tracing::info!(agent = %agent_id, "agent deregistered");
        archive_agent_change(
            &self.history,
            AgentChange::new(agent_id, AgentChangeKind::Deregistered, Some(record.descriptor.clone())),
        );
        Ok(record.descriptor)
    }

    /// 心跳过期检查，返回本次转为 Offline 的 Agent
    pub async fn sweep(&self) -> Vec<String> {
        let limit = self.heartbeat_interval * self.missed_heartbeat_limit;
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut state = self.state.write().await;
            for (agent_id, record) in state.agents.iter_mut() {
                let Some(seen) = record.last_seen else { continue };
                if !record.offline && now.duration_since(seen) >= limit {
                    record.offline = true;
                    expired.push(agent_id.clone());
                }
            }
        }
        for agent_id in &expired {
            tracing::warn!(
                agent = %agent_id,
                missed = self.missed_heartbeat_limit,
                "agent missed heartbeats, marked offline"
            );
            archive_agent_change(
                &self.history,
                AgentChange::new(agent_id, AgentChangeKind::Offline, None),
            );
        }
        expired
    }

    pub async fn health(&self, agent_id: &str) -> Option<HealthState> {
        let state = self.state.read().await;
        state.agents.get(agent_id).map(|r| {
            derive_health(
                r,
                self.breakers.state(agent_id),
                Instant::now(),
                self.heartbeat_interval,
            )
        })
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.state
            .read()
            .await
            .agents
            .get(agent_id)
            .map(|r| r.descriptor.clone())
    }

    /// 全部 Agent（含 Offline），按注册顺序
    pub async fn list(&self) -> Vec<AgentSnapshot> {
        let state = self.state.read().await;
        let now = Instant::now();
        let mut all: Vec<AgentSnapshot> = state.agents.values().map(|r| self.snapshot(r, now)).collect();
        all.sort_by_key(|s| s.registration_seq);
        all
    }

    pub async fn begin_dispatch(&self, agent_id: &str) {
        if let Some(record) = self.state.write().await.agents.get_mut(agent_id) {
            record.in_flight += 1;
        }
    }

    /// 结束一次派发；`outcome` 为 None 表示无结论（取消）
    pub async fn end_dispatch(&self, agent_id: &str, outcome: Option<bool>) {
        if let Some(record) = self.state.write().await.agents.get_mut(agent_id) {
            record.in_flight = record.in_flight.saturating_sub(1);
            match outcome {
                Some(true) => record.successes += 1,
                Some(false) => record.failures += 1,
                None => {}
            }
        }
    }
}
