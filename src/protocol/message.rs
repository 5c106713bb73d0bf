//! Agent 协议消息定义
//!
//! 统一信封（id / kind / 版本 / 时间戳 / 收发方 / 会话 / 优先级 / metadata）+ 按 kind 区分的 payload。
//! 信封字段在 [`Message`] 上，payload 由 [`MessageBody`] 承载；线上格式见 `codec`。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 当前实现使用的协议版本
pub const PROTOCOL_VERSION: &str = "1.0";

/// 编排器在信封中使用的发送方 ID
pub const ORCHESTRATOR_ID: &str = "hive-orchestrator";

/// 消息优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Registration,
    RegistrationAck,
    CommandRequest,
    CommandResponse,
    ProgressUpdate,
    Heartbeat,
    HeartbeatAck,
    Disconnect,
    Cancel,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::Registration,
        MessageKind::RegistrationAck,
        MessageKind::CommandRequest,
        MessageKind::CommandResponse,
        MessageKind::ProgressUpdate,
        MessageKind::Heartbeat,
        MessageKind::HeartbeatAck,
        MessageKind::Disconnect,
        MessageKind::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Registration => "Registration",
            MessageKind::RegistrationAck => "RegistrationAck",
            MessageKind::CommandRequest => "CommandRequest",
            MessageKind::CommandResponse => "CommandResponse",
            MessageKind::ProgressUpdate => "ProgressUpdate",
            MessageKind::Heartbeat => "Heartbeat",
            MessageKind::HeartbeatAck => "HeartbeatAck",
            MessageKind::Disconnect => "Disconnect",
            MessageKind::Cancel => "Cancel",
        }
    }

    /// 需要对端给出响应（或超时）的请求类消息
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            MessageKind::Registration | MessageKind::CommandRequest | MessageKind::Heartbeat
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// Agent 类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentType {
    ApplicationAutomation,
    Browser,
    DataProcessing,
    Custom,
    Service,
}

/// Agent 声明的一项能力
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(default)]
    pub output_schema: Value,
    /// 单次调用超时（秒），必须大于 0
    #[serde(alias = "timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub supports_async: bool,
    #[serde(default)]
    pub supports_progress: bool,
}

impl Capability {
    pub fn new(name: impl Into<String>, timeout_seconds: u64) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: Value::Null,
            output_schema: Value::Null,
            timeout_seconds,
            supports_async: false,
            supports_progress: false,
        }
    }

    pub fn with_progress(mut self) -> Self {
        self.supports_progress = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationPayload {
    pub agent_id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub capabilities: Vec<Capability>,
    pub supported_versions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationAckPayload {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negotiated_version: Option<String>,
    #[serde(default)]
    pub heartbeat_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequestPayload {
    pub target_agent_id: String,
    pub capability_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub timeout_seconds: u64,
    #[serde(rename = "async", default)]
    pub run_async: bool,
    #[serde(default)]
    pub report_progress: bool,
}

/// Agent 端执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Accepted,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Accepted | ExecutionStatus::Running)
    }
}

/// Agent 返回的错误信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// 约定的错误码：Agent 忙（可重试）
pub const ERROR_CODE_BUSY: &str = "AGENT_BUSY";
/// 约定的错误码：参数被拒绝（不重试）
pub const ERROR_CODE_REJECTED: &str = "INVALID_PARAMETERS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponsePayload {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdatePayload {
    pub execution_id: String,
    pub percentage: u8,
    #[serde(default)]
    pub current_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_results: Option<Value>,
}

/// Agent 自报状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Idle,
    Busy,
    Maintenance,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub agent_status: AgentStatus,
    #[serde(default)]
    pub system_info: SystemInfo,
    #[serde(default)]
    pub active_task_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckPayload {
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectPayload {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    pub execution_id: String,
    #[serde(default)]
    pub reason: String,
}

/// 按类型区分的消息体
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Registration(RegistrationPayload),
    RegistrationAck(RegistrationAckPayload),
    CommandRequest(CommandRequestPayload),
    CommandResponse(CommandResponsePayload),
    ProgressUpdate(ProgressUpdatePayload),
    Heartbeat(HeartbeatPayload),
    HeartbeatAck(HeartbeatAckPayload),
    Disconnect(DisconnectPayload),
    Cancel(CancelPayload),
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Registration(_) => MessageKind::Registration,
            MessageBody::RegistrationAck(_) => MessageKind::RegistrationAck,
            MessageBody::CommandRequest(_) => MessageKind::CommandRequest,
            MessageBody::CommandResponse(_) => MessageKind::CommandResponse,
            MessageBody::ProgressUpdate(_) => MessageKind::ProgressUpdate,
            MessageBody::Heartbeat(_) => MessageKind::Heartbeat,
            MessageBody::HeartbeatAck(_) => MessageKind::HeartbeatAck,
            MessageBody::Disconnect(_) => MessageKind::Disconnect,
            MessageBody::Cancel(_) => MessageKind::Cancel,
        }
    }
}

/// 协议消息（信封 + 消息体）
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub protocol_version: String,
    pub timestamp: DateTime<Utc>,
    pub sender_id: String,
    pub receiver_id: String,
    pub session_id: String,
    pub priority: Priority,
    /// 本消息所响应的请求 id（请求类消息为空）
    pub correlation_id: Option<String>,
    pub metadata: Map<String, Value>,
    pub body: MessageBody,
}

impl Message {
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        session_id: impl Into<String>,
        body: MessageBody,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            session_id: session_id.into(),
            priority: Priority::Normal,
            correlation_id: None,
            metadata: Map::new(),
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn correlated_to(mut self, request_id: impl Into<String>) -> Self {
        self.correlation_id = Some(request_id.into());
        self
    }

    /// 构造对本消息的响应：收发方互换，沿用会话，并关联到本消息 id
    pub fn reply(&self, body: MessageBody) -> Message {
        Message::new(
            self.receiver_id.clone(),
            self.sender_id.clone(),
            self.session_id.clone(),
            body,
        )
        .with_version(self.protocol_version.clone())
        .correlated_to(self.id.clone())
    }

    pub fn disconnect(sender: &str, receiver: &str, reason: impl Into<String>) -> Message {
        Message::new(
            sender,
            receiver,
            "",
            MessageBody::Disconnect(DisconnectPayload {
                reason: reason.into(),
            }),
        )
    }
}
