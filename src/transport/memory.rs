//! 进程内传输
//!
//! Agent 以 [`LocalAgent`] 实现注册到 [`MemoryTransport`]，收发仍经过编解码器，
//! 行为与线上传输一致（含协议错误）。每条入站消息在独立任务中处理，因此 Agent
//! 执行长命令时仍能收到 Cancel。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::stdio::decode_frame;
use super::{
    ConnectOptions, Connection, TransportAdapter, TransportConfig, TransportError, TransportKind,
    TransportSession,
};
use crate::protocol::{Codec, Message};

/// 进程内 Agent：收到消息后通过 outbox 回复
#[async_trait]
pub trait LocalAgent: Send + Sync {
    /// 连接建立时调用（例如主动发送 Registration）
    async fn on_connect(&self, _outbox: &mpsc::Sender<Message>) {}

    async fn on_message(&self, message: Message, outbox: &mpsc::Sender<Message>);
}

#[derive(Default)]
struct Registry {
    agents: HashMap<String, Arc<dyn LocalAgent>>,
    /// 连接尝试次数（含失败）
    attempts: HashMap<String, usize>,
}

/// 进程内传输适配器
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Registry>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, agent_id: impl Into<String>, agent: Arc<dyn LocalAgent>) {
        self.lock().agents.insert(agent_id.into(), agent);
    }

    /// 移除后新的连接尝试失败（模拟 Agent 不可达）；已建立的连接不受影响
    pub fn unregister(&self, agent_id: &str) {
        self.lock().agents.remove(agent_id);
    }

    pub fn connect_count(&self, agent_id: &str) -> usize {
        self.lock().attempts.get(agent_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TransportAdapter for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    async fn connect(
        &self,
        agent_id: &str,
        _config: &TransportConfig,
        options: &ConnectOptions,
    ) -> Result<Connection, TransportError> {
        let agent = {
            let mut registry = self.lock();
            *registry.attempts.entry(agent_id.to_string()).or_insert(0) += 1;
            registry.agents.get(agent_id).cloned()
        }
        .ok_or_else(|| TransportError::connect(agent_id, "agent not reachable"))?;

        let capacity = options.channel_capacity.max(1);
        let (to_agent_tx, mut to_agent_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let (from_agent_tx, from_agent_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(capacity);
        let closed = CancellationToken::new();

        // Agent 侧：解码入站帧，逐条交给 on_message
        {
            let codec = options.codec.clone();
            let closed = closed.clone();
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                agent.on_connect(&outbox_tx).await;
                loop {
                    let frame = tokio::select! {
                        _ = closed.cancelled() => break,
                        frame = to_agent_rx.recv() => frame,
                    };
                    let Some(frame) = frame else { break };
                    match codec.decode(&frame) {
                        Ok(message) => {
                            let agent = Arc::clone(&agent);
                            let outbox = outbox_tx.clone();
                            tokio::spawn(async move {
                                agent.on_message(message, &outbox).await;
                            });
                        }
                        Err(e) => tracing::warn!(agent = %agent_id, "local agent dropped frame: {}", e),
                    }
                }
            });
        }

        // outbox 中的消息编码后送回编排器侧
        {
            let codec = options.codec.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = closed.cancelled() => break,
                        message = outbox_rx.recv() => message,
                    };
                    let Some(message) = message else { break };
                    match codec.encode(&message) {
                        Ok(frame) => {
                            if from_agent_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("local agent produced unencodable message: {}", e),
                    }
                }
            });
        }

        let session = MemorySession {
            agent_id: agent_id.to_string(),
            to_agent: Some(to_agent_tx),
            from_agent: from_agent_rx,
            codec: options.codec.clone(),
            closed,
        };
        Ok(Connection::new(agent_id, TransportKind::InProcess, Box::new(session)))
    }
}

struct MemorySession {
    agent_id: String,
    to_agent: Option<mpsc::Sender<Vec<u8>>>,
    from_agent: mpsc::Receiver<Vec<u8>>,
    codec: Codec,
    closed: CancellationToken,
}

#[async_trait]
impl TransportSession for MemorySession {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let tx = self.to_agent.as_ref().ok_or(TransportError::Closed)?;
        let frame = self.codec.encode(message)?;
        tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<Message, TransportError> {
        match self.from_agent.recv().await {
            Some(frame) => decode_frame(&self.codec, &self.agent_id, &frame),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) {
        self.to_agent.take();
        self.closed.cancel();
    }

    fn is_healthy(&self) -> bool {
        !self.closed.is_cancelled() && self.to_agent.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}
