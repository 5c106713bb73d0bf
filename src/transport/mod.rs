//! 传输层：每个 Agent 一条可插拔通道
//!
//! 三种线上传输（子进程 stdio、长连接事件流、分块 HTTP）+ 进程内传输，均实现 [`TransportAdapter`]，
//! 连接后得到同一种 [`Connection`]，编排器因此与具体传输无关；选择哪种传输只看 AgentDescriptor 声明的 kind。

pub mod chunked_http;
pub mod event_stream;
pub mod memory;
pub mod stdio;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::protocol::{Codec, CodecError, Message, ORCHESTRATOR_ID};

pub use chunked_http::ChunkedHttpTransport;
pub use event_stream::EventStreamTransport;
pub use memory::{LocalAgent, MemoryTransport};
pub use stdio::StdioTransport;

/// 按行分隔的传输（stdio、分块 HTTP）单帧上限
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// 子进程标准输入输出，按行分隔
    Stdio,
    /// 长连接 SSE 事件流 + 独立 HTTP 请求发送
    EventStream,
    /// 单个请求/响应对上的双向分块流
    ChunkedHttp,
    /// 同进程 Agent（嵌入式与测试）
    InProcess,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::EventStream => write!(f, "event_stream"),
            TransportKind::ChunkedHttp => write!(f, "chunked_http"),
            TransportKind::InProcess => write!(f, "in_process"),
        }
    }
}

/// Agent 的传输配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// stdio：可执行文件
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// event_stream / chunked_http：Agent 基础 URL
    #[serde(default)]
    pub endpoint: Option<String>,
    /// 连接后是否等待 Agent 的 Registration 并协商版本
    #[serde(default = "default_handshake")]
    pub handshake: bool,
}

fn default_handshake() -> bool {
    true
}

impl TransportConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: TransportKind::Stdio,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            endpoint: None,
            handshake: true,
        }
    }

    pub fn http(kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            endpoint: Some(endpoint.into()),
            handshake: true,
        }
    }

    pub fn in_process() -> Self {
        Self {
            kind: TransportKind::InProcess,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            endpoint: None,
            handshake: false,
        }
    }

    pub fn with_handshake(mut self, handshake: bool) -> Self {
        self.handshake = handshake;
        self
    }
}

/// 传输层错误（连接 / 发送 / 接收 / 解码）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("failed to connect to agent {agent_id}: {reason}")]
    Connect { agent_id: String, reason: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("connection closed")]
    Closed,

    #[error("transport timed out after {0:?}")]
    Timeout(Duration),

    #[error("undecodable frame: {0}")]
    Protocol(#[from] CodecError),

    #[error("unsupported transport kind: {0}")]
    Unsupported(TransportKind),
}

impl TransportError {
    pub(crate) fn connect(agent_id: &str, reason: impl fmt::Display) -> Self {
        TransportError::Connect {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// 建立连接时的公共参数
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    /// 入站消息缓冲（有界，满时读循环等待）
    pub channel_capacity: usize,
    pub codec: Codec,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            channel_capacity: 64,
            codec: Codec::default(),
        }
    }
}

/// 一条已建立的传输会话（由 Connection 独占）
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError>;

    /// 等待下一条入站消息
    async fn receive(&mut self) -> Result<Message, TransportError>;

    /// 关闭并释放底层资源（进程 / HTTP 流）
    async fn close(&mut self);

    fn is_healthy(&self) -> bool;
}

/// 传输适配器：按配置建立连接
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(
        &self,
        agent_id: &str,
        config: &TransportConfig,
        options: &ConnectOptions,
    ) -> Result<Connection, TransportError>;
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Closing,
}

/// 单条 Agent 连接：持有唯一的传输会话，由连接池独占，每次只借给一个在途请求
pub struct Connection {
    id: String,
    agent_id: String,
    kind: TransportKind,
    state: ConnectionState,
    session: Box<dyn TransportSession>,
    created_at: Instant,
    last_used: Instant,
    negotiated_version: Option<String>,
    requests_served: u64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    pub fn new(agent_id: &str, kind: TransportKind, session: Box<dyn TransportSession>) -> Self {
        let now = Instant::now();
        Self {
            id: format!("conn_{}", uuid::Uuid::new_v4()),
            agent_id: agent_id.to_string(),
            kind,
            state: ConnectionState::Connected,
            session,
            created_at: now,
            last_used: now,
            negotiated_version: None,
            requests_served: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    pub fn negotiated_version(&self) -> Option<&str> {
        self.negotiated_version.as_deref()
    }

    pub(crate) fn set_negotiated_version(&mut self, version: String) {
        self.negotiated_version = Some(version);
    }

    /// 请求结束后标记状态未知（如超时、取消），连接不再复用
    pub fn mark_degraded(&mut self) {
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Degraded;
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
        self.requests_served += 1;
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Closing
        ) {
            return Err(TransportError::Closed);
        }
        let result = self.session.send(message).await;
        if result.is_err() {
            self.state = ConnectionState::Degraded;
        }
        result
    }

    pub async fn receive(&mut self) -> Result<Message, TransportError> {
        if self.state == ConnectionState::Disconnected {
            return Err(TransportError::Closed);
        }
        let result = self.session.receive().await;
        match &result {
            Err(TransportError::Protocol(_)) => {}
            Err(_) => self.state = ConnectionState::Degraded,
            Ok(_) => {}
        }
        result
    }

    pub async fn receive_timeout(&mut self, timeout: Duration) -> Result<Message, TransportError> {
        match tokio::time::timeout(timeout, self.receive()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// 尽力通知 Agent 断开，然后关闭会话
    pub async fn close(&mut self, reason: &str) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        if self.session.is_healthy() {
            let bye = Message::disconnect(ORCHESTRATOR_ID, &self.agent_id, reason);
            let _ = tokio::time::timeout(Duration::from_millis(500), self.session.send(&bye)).await;
        }
        self.state = ConnectionState::Closing;
        self.session.close().await;
        self.state = ConnectionState::Disconnected;
        tracing::debug!(agent = %self.agent_id, conn = %self.id, "connection closed: {}", reason);
    }

    pub fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Connected && self.session.is_healthy()
    }
}

/// 按传输类型索引的适配器集合
#[derive(Clone, Default)]
pub struct TransportSet {
    adapters: HashMap<TransportKind, Arc<dyn TransportAdapter>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// stdio / event_stream / chunked_http 三种线上传输
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut set = Self::new();
        set.register(Arc::new(StdioTransport::new()));
        set.register(Arc::new(EventStreamTransport::new(client.clone())));
        set.register(Arc::new(ChunkedHttpTransport::new(client)));
        set
    }

    pub fn register(&mut self, adapter: Arc<dyn TransportAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn TransportAdapter>, TransportError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(TransportError::Unsupported(kind))
    }
}
