//! 连接池：连接生命周期、复用与健康跟踪
//!
//! 每个 Agent 一组连接：Semaphore 限制同时借出的连接数（硬上限），空闲连接留在队列中复用
//! （最多 max_idle 条）。连接借出期间由 [`ConnectionLease`] 独占，同一连接上同时只有一个在途请求。
//! 新建连接时按需完成注册握手与版本协商。
//!
//! 空闲连接并不闲置：每条都由一个后台读循环持有，回复心跳、刷新目录；Agent 发来 Disconnect 时
//! 注销该 Agent 并关闭它的全部空闲连接。借出时读循环停止并交回连接。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PoolSection;
use crate::core::HiveError;
use crate::directory::{AgentDescriptor, AgentDirectory, DirectoryError};
use crate::protocol::{
    negotiate_version, CodecError, HeartbeatAckPayload, HeartbeatPayload, Message, MessageBody,
    RegistrationAckPayload,
};
use crate::transport::{ConnectOptions, Connection, TransportError, TransportSet};

/// 连接池参数
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_agent: usize,
    pub max_connections_per_agent: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_agent: 2,
            max_connections_per_agent: 4,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&PoolSection> for PoolConfig {
    fn from(section: &PoolSection) -> Self {
        Self {
            max_idle_per_agent: section.max_idle_per_agent,
            max_connections_per_agent: section.max_connections_per_agent.max(1),
            acquire_timeout: Duration::from_millis(section.acquire_timeout_ms),
            idle_timeout: Duration::from_secs(section.idle_timeout_secs),
            handshake_timeout: Duration::from_millis(section.handshake_timeout_ms),
        }
    }
}

/// 空闲连接：连接本身在读循环任务里
struct IdleConnection {
    last_used: Instant,
    handback: CancellationToken,
    reader: JoinHandle<Option<Connection>>,
}

impl IdleConnection {
    /// 停止读循环并取回连接；空闲期间连接已失效则返回 None
    async fn reclaim(self) -> Option<Connection> {
        self.handback.cancel();
        self.reader.await.ok().flatten()
    }
}

struct AgentPool {
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection>>,
    /// Agent 断开或被驱逐：空闲连接各自关闭，归还的连接不再入池
    retired: CancellationToken,
}

impl AgentPool {
    fn new(max_connections: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            idle: Mutex::new(VecDeque::new()),
            retired: CancellationToken::new(),
        }
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 借出的连接；用完交回 [`ConnectionPool::release`]，状态可疑时调用 [`ConnectionPool::discard`]
pub struct ConnectionLease {
    conn: Option<Connection>,
    pool: Arc<AgentPool>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    pub fn connection(&mut self) -> Result<&mut Connection, HiveError> {
        self.conn
            .as_mut()
            .ok_or(HiveError::Transport(TransportError::Closed))
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.conn.as_ref().map(|c| c.agent_id())
    }
}

/// 记录心跳并回复 HeartbeatAck
pub(crate) async fn answer_heartbeat(
    directory: &AgentDirectory,
    conn: &mut Connection,
    incoming: &Message,
    heartbeat: &HeartbeatPayload,
) -> Result<(), TransportError> {
    if let Err(e) = directory.heartbeat(conn.agent_id(), heartbeat).await {
        tracing::warn!(agent = %conn.agent_id(), "heartbeat rejected: {}", e);
    }
    let ack = incoming.reply(MessageBody::HeartbeatAck(HeartbeatAckPayload {
        received_at: Utc::now(),
    }));
    conn.send(&ack).await
}

async fn forget_agent(directory: &AgentDirectory, agent_id: &str, reason: &str) {
    tracing::info!(agent = %agent_id, "agent disconnected: {}", reason);
    match directory.deregister(agent_id).await {
        Ok(_) | Err(DirectoryError::UnknownAgent(_)) => {}
        Err(e) => tracing::warn!(agent = %agent_id, "failed to deregister: {}", e),
    }
}

/// 空闲连接的读循环
async fn watch_idle(
    mut conn: Connection,
    directory: Arc<AgentDirectory>,
    handback: CancellationToken,
    retired: CancellationToken,
) -> Option<Connection> {
    enum Next {
        Retired,
        Handback,
        Incoming(Result<Message, TransportError>),
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = retired.cancelled() => Next::Retired,
            _ = handback.cancelled() => Next::Handback,
            incoming = conn.receive() => Next::Incoming(incoming),
        };
        let incoming = match next {
            Next::Handback => return Some(conn),
            Next::Retired => {
                conn.close("agent retired").await;
                return None;
            }
            Next::Incoming(Err(TransportError::Protocol(_))) => continue,
            Next::Incoming(Err(e)) => {
                tracing::debug!(agent = %conn.agent_id(), conn = %conn.id(), "idle connection lost: {}", e);
                conn.close("idle read failed").await;
                return None;
            }
            Next::Incoming(Ok(message)) => message,
        };

        match &incoming.body {
            MessageBody::Heartbeat(heartbeat) => {
                if let Err(e) = answer_heartbeat(&directory, &mut conn, &incoming, heartbeat).await {
                    tracing::debug!(agent = %conn.agent_id(), "heartbeat ack failed: {}", e);
                    conn.close("heartbeat ack failed").await;
                    return None;
                }
            }
            MessageBody::Disconnect(bye) => {
                retired.cancel();
                forget_agent(&directory, conn.agent_id(), &bye.reason).await;
                conn.close("agent disconnected").await;
                return None;
            }
            _ => tracing::debug!(
                agent = %conn.agent_id(),
                kind = %incoming.kind(),
                "dropping message on idle connection"
            ),
        }
    }
}

/// 连接池
pub struct ConnectionPool {
    transports: TransportSet,
    options: ConnectOptions,
    config: PoolConfig,
    directory: Arc<AgentDirectory>,
    pools: Mutex<HashMap<String, Arc<AgentPool>>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        transports: TransportSet,
        options: ConnectOptions,
        config: PoolConfig,
        directory: Arc<AgentDirectory>,
    ) -> Self {
        Self {
            transports,
            options,
            config,
            directory,
            pools: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn agent_pool(&self, agent_id: &str) -> Arc<AgentPool> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let max = self.config.max_connections_per_agent;
        let entry = pools
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(AgentPool::new(max)));
        if entry.retired.is_cancelled() {
            *entry = Arc::new(AgentPool::new(max));
        }
        Arc::clone(entry)
    }

    /// 借出一条连接：优先复用空闲健康连接，否则新建；达到上限时等待，超时返回 `PoolExhausted`
    pub async fn acquire(&self, descriptor: &AgentDescriptor) -> Result<ConnectionLease, HiveError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HiveError::Internal("connection pool is shut down".into()));
        }
        let agent_id = descriptor.agent_id.as_str();
        let pool = self.agent_pool(agent_id);
        let permit = match tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&pool.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                tracing::warn!(agent = %agent_id, "connection pool exhausted");
                return Err(HiveError::PoolExhausted(agent_id.to_string()));
            }
        };

        loop {
            let next = pool.idle().pop_front();
            let Some(entry) = next else { break };
            let fresh = entry.last_used.elapsed() < self.config.idle_timeout;
            match entry.reclaim().await {
                Some(conn) if fresh && conn.is_healthy() => {
                    tracing::debug!(agent = %agent_id, conn = %conn.id(), "reusing pooled connection");
                    return Ok(ConnectionLease {
                        conn: Some(conn),
                        pool,
                        _permit: permit,
                    });
                }
                Some(mut conn) => conn.close("stale").await,
                None => {}
            }
        }

        let conn = self.open(descriptor).await?;
        Ok(ConnectionLease {
            conn: Some(conn),
            pool,
            _permit: permit,
        })
    }

    async fn open(&self, descriptor: &AgentDescriptor) -> Result<Connection, HiveError> {
        let agent_id = descriptor.agent_id.as_str();
        let adapter = self.transports.get(descriptor.transport.kind)?;
        let mut conn = match tokio::time::timeout(
            self.options.connect_timeout,
            adapter.connect(agent_id, &descriptor.transport, &self.options),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(TransportError::connect(
                    agent_id,
                    format!("connect timed out after {:?}", self.options.connect_timeout),
                )
                .into())
            }
        };
        tracing::info!(
            agent = %agent_id,
            conn = %conn.id(),
            transport = %descriptor.transport.kind,
            "connection established"
        );

        if descriptor.transport.handshake {
            if let Err(e) = self.handshake(&mut conn, descriptor).await {
                tracing::warn!(agent = %agent_id, "handshake failed: {}", e);
                conn.close("handshake failed").await;
                return Err(e);
            }
        }
        Ok(conn)
    }

    /// 等待 Agent 的 Registration，协商版本并刷新目录，回复 RegistrationAck
    async fn handshake(&self, conn: &mut Connection, descriptor: &AgentDescriptor) -> Result<(), HiveError> {
        let first = conn.receive_timeout(self.config.handshake_timeout).await?;
        let MessageBody::Registration(registration) = &first.body else {
            return Err(HiveError::Protocol(CodecError::MalformedMessage {
                reason: format!("expected Registration, got {}", first.kind()),
                raw: String::new(),
            }));
        };

        let refuse = |reason: String| {
            first.reply(MessageBody::RegistrationAck(RegistrationAckPayload {
                accepted: false,
                negotiated_version: None,
                heartbeat_interval_secs: 0,
                reason: Some(reason),
            }))
        };

        if registration.agent_id != descriptor.agent_id {
            let reason = format!(
                "agent id mismatch: expected {}, got {}",
                descriptor.agent_id, registration.agent_id
            );
            let _ = conn.send(&refuse(reason.clone())).await;
            return Err(HiveError::Protocol(CodecError::MalformedMessage {
                reason,
                raw: String::new(),
            }));
        }

        let Some(version) =
            negotiate_version(self.options.codec.supported_versions(), &registration.supported_versions)
        else {
            let _ = conn
                .send(&refuse("no common protocol version".to_string()))
                .await;
            return Err(HiveError::Protocol(CodecError::UnsupportedVersion(
                registration.supported_versions.join(","),
            )));
        };

        let refreshed = AgentDescriptor::from_registration(
            registration,
            descriptor.transport.clone(),
            descriptor.priority,
        );
        if let Err(e) = self.directory.register(refreshed).await {
            let _ = conn.send(&refuse(e.to_string())).await;
            return Err(e.into());
        }
        self.directory.mark_alive(&descriptor.agent_id).await?;

        let ack = first
            .reply(MessageBody::RegistrationAck(RegistrationAckPayload {
                accepted: true,
                negotiated_version: Some(version.clone()),
                heartbeat_interval_secs: self.directory.heartbeat_interval().as_secs(),
                reason: None,
            }))
            .with_version(version.clone());
        conn.send(&ack).await?;
        tracing::info!(agent = %descriptor.agent_id, version = %version, "agent registered over connection");
        conn.set_negotiated_version(version);
        Ok(())
    }

    fn watch(&self, conn: Connection, pool: &AgentPool) -> IdleConnection {
        let handback = CancellationToken::new();
        IdleConnection {
            last_used: conn.last_used(),
            handback: handback.clone(),
            reader: tokio::spawn(watch_idle(
                conn,
                Arc::clone(&self.directory),
                handback,
                pool.retired.clone(),
            )),
        }
    }

    /// 归还连接：健康且空闲队列未满则保留（交给读循环），否则关闭
    pub async fn release(&self, mut lease: ConnectionLease) {
        let Some(mut conn) = lease.conn.take() else { return };
        conn.touch();
        let keep = !self.closed.load(Ordering::SeqCst)
            && !lease.pool.retired.is_cancelled()
            && conn.is_healthy();
        if keep {
            let mut idle = lease.pool.idle();
            if idle.len() < self.config.max_idle_per_agent {
                idle.push_back(self.watch(conn, &lease.pool));
                return;
            }
        }
        conn.close("released").await;
    }

    /// 丢弃连接（超时、取消、传输错误后状态未知）
    pub async fn discard(&self, mut lease: ConnectionLease, reason: &str) {
        if let Some(mut conn) = lease.conn.take() {
            conn.mark_degraded();
            conn.close(reason).await;
        }
    }

    /// Agent 在请求过程中发来 Disconnect：注销并关闭其空闲连接
    pub async fn agent_disconnected(&self, agent_id: &str, reason: &str) {
        forget_agent(&self.directory, agent_id, reason).await;
        self.evict(agent_id).await;
    }

    /// 关闭超过空闲时限或已失效的空闲连接，返回清理数量
    pub async fn cleanup_idle(&self) -> usize {
        let pools: Vec<Arc<AgentPool>> = self
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut expired = Vec::new();
        for pool in pools {
            let mut idle = pool.idle();
            let (keep, stale): (VecDeque<_>, VecDeque<_>) = idle.drain(..).partition(|c| {
                !c.reader.is_finished() && c.last_used.elapsed() < self.config.idle_timeout
            });
            *idle = keep;
            expired.extend(stale);
        }
        let count = expired.len();
        for entry in expired {
            if let Some(mut conn) = entry.reclaim().await {
                conn.close("idle timeout").await;
            }
        }
        if count > 0 {
            tracing::debug!("closed {} idle connections", count);
        }
        count
    }

    /// 关闭某个 Agent 的全部空闲连接（Agent 下线或注销时）
    pub async fn evict(&self, agent_id: &str) {
        let pool = self
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(agent_id);
        if let Some(pool) = pool {
            pool.retired.cancel();
            let entries: Vec<IdleConnection> = pool.idle().drain(..).collect();
            for entry in entries {
                // 读循环看到 retired 后自行关闭连接
                let _ = entry.reader.await;
            }
        }
    }

    /// 关闭全部空闲连接，此后借出的连接归还时直接关闭
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let agents: Vec<String> = self
            .pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for agent_id in agents {
            self.evict(&agent_id).await;
        }
        tracing::info!("connection pool closed");
    }

    /// 仍在读循环中的空闲连接数
    pub fn idle_count(&self, agent_id: &str) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .filter(|p| !p.retired.is_cancelled())
            .map(|p| p.idle().iter().filter(|c| !c.reader.is_finished()).count())
            .unwrap_or(0)
    }

    /// 版本协商后发送时使用的协议版本
    pub fn message_version(conn: &Connection) -> String {
        conn.negotiated_version()
            .map(str::to_string)
            .unwrap_or_else(|| crate::protocol::PROTOCOL_VERSION.to_string())
    }
}

/// 构造发往 Agent 的请求消息
pub fn outbound(conn: &Connection, session_id: &str, body: MessageBody) -> Message {
    Message::new(
        crate::protocol::ORCHESTRATOR_ID,
        conn.agent_id(),
        session_id,
        body,
    )
    .with_version(ConnectionPool::message_version(conn))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DirectorySection;
    use crate::history::InMemoryHistory;
    use crate::directory::CapabilityQuery;
    use crate::protocol::{AgentStatus, AgentType, Capability, RegistrationPayload, SystemInfo, ORCHESTRATOR_ID};
    use crate::resilience::{BreakerConfig, BreakerRegistry};
    use crate::transport::{LocalAgent, MemoryTransport, TransportConfig};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Silent;

    #[async_trait]
    impl LocalAgent for Silent {
        async fn on_message(&self, _message: Message, _outbox: &mpsc::Sender<Message>) {}
    }

    fn registration(agent_id: &str, versions: Vec<String>) -> Message {
        Message::new(
            agent_id,
            ORCHESTRATOR_ID,
            "",
            MessageBody::Registration(RegistrationPayload {
                agent_id: agent_id.into(),
                name: "Registering".into(),
                version: "2.0.0".into(),
                agent_type: AgentType::Service,
                capabilities: vec![Capability::new("SendEmail", 30)],
                supported_versions: versions,
            }),
        )
    }

    /// 连接后主动注册的 Agent，可按固定间隔发送心跳
    struct Registering {
        agent_id: String,
        versions: Vec<String>,
        heartbeat: Option<Duration>,
    }

    impl Registering {
        fn new(versions: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                agent_id: "reg".into(),
                versions: versions.iter().map(|v| v.to_string()).collect(),
                heartbeat: None,
            })
        }

        fn beating(every: Duration) -> Arc<Self> {
            Arc::new(Self {
                agent_id: "reg".into(),
                versions: vec!["1.0".into()],
                heartbeat: Some(every),
            })
        }
    }

    #[async_trait]
    impl LocalAgent for Registering {
        async fn on_connect(&self, outbox: &mpsc::Sender<Message>) {
            let _ = outbox
                .send(registration(&self.agent_id, self.versions.clone()))
                .await;
            let Some(every) = self.heartbeat else { return };
            let outbox = outbox.clone();
            let agent_id = self.agent_id.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(every).await;
                    let beat = Message::new(
                        &agent_id,
                        ORCHESTRATOR_ID,
                        "",
                        MessageBody::Heartbeat(HeartbeatPayload {
                            agent_status: AgentStatus::Idle,
                            system_info: SystemInfo::default(),
                            active_task_count: 0,
                        }),
                    );
                    if outbox.send(beat).await.is_err() {
                        break;
                    }
                }
            });
        }

        async fn on_message(&self, _message: Message, _outbox: &mpsc::Sender<Message>) {}
    }

    /// 注册后等待测试触发，再主动断开
    #[derive(Default)]
    struct Leaving {
        outbox: Mutex<Option<mpsc::Sender<Message>>>,
    }

    impl Leaving {
        async fn leave(&self) {
            let outbox = self.outbox.lock().unwrap().clone();
            if let Some(outbox) = outbox {
                outbox
                    .send(Message::disconnect("reg", ORCHESTRATOR_ID, "maintenance"))
                    .await
                    .unwrap();
            }
        }
    }

    #[async_trait]
    impl LocalAgent for Leaving {
        async fn on_connect(&self, outbox: &mpsc::Sender<Message>) {
            let _ = outbox.send(registration("reg", vec!["1.0".into()])).await;
            *self.outbox.lock().unwrap() = Some(outbox.clone());
        }

        async fn on_message(&self, _message: Message, _outbox: &mpsc::Sender<Message>) {}
    }

    fn setup(config: PoolConfig) -> (ConnectionPool, MemoryTransport, Arc<AgentDirectory>) {
        let memory = MemoryTransport::new();
        let mut transports = TransportSet::new();
        transports.register(Arc::new(memory.clone()));
        let directory = Arc::new(AgentDirectory::new(
            &DirectorySection::default(),
            Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            Arc::new(InMemoryHistory::new()),
        ));
        let pool = ConnectionPool::new(
            transports,
            ConnectOptions::default(),
            config,
            Arc::clone(&directory),
        );
        (pool, memory, directory)
    }

    fn descriptor(id: &str) -> AgentDescriptor {
        AgentDescriptor::new(id, AgentType::Service, TransportConfig::in_process())
            .with_capability(Capability::new("SendEmail", 30))
    }

    #[tokio::test]
    async fn test_release_reuses_connection() {
        let (pool, memory, _) = setup(PoolConfig::default());
        memory.register("a", Arc::new(Silent));
        let mut lease = pool.acquire(&descriptor("a")).await.unwrap();
        let first_id = lease.connection().unwrap().id().to_string();
        pool.release(lease).await;
        assert_eq!(pool.idle_count("a"), 1);

        let mut lease = pool.acquire(&descriptor("a")).await.unwrap();
        assert_eq!(lease.connection().unwrap().id(), first_id);
        assert_eq!(memory.connect_count("a"), 1);
        pool.discard(lease, "test").await;
        assert_eq!(pool.idle_count("a"), 0);
    }

    #[tokio::test]
    async fn test_pool_exhausted_at_hard_cap() {
        let (pool, memory, _) = setup(PoolConfig {
            max_connections_per_agent: 1,
            acquire_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        });
        memory.register("a", Arc::new(Silent));
        let held = pool.acquire(&descriptor("a")).await.unwrap();
        let err = pool.acquire(&descriptor("a")).await.err();
        assert_eq!(err, Some(HiveError::PoolExhausted("a".into())));
        pool.release(held).await;
        assert!(pool.acquire(&descriptor("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_handshake_negotiates_version() {
        let (pool, memory, directory) = setup(PoolConfig::default());
        memory.register("reg", Registering::new(&["1.0", "2.0"]));
        let desc = AgentDescriptor::new("reg", AgentType::Service, TransportConfig::in_process().with_handshake(true));
        let mut lease = pool.acquire(&desc).await.unwrap();
        assert_eq!(lease.connection().unwrap().negotiated_version(), Some("1.0"));
        let refreshed = directory.get("reg").await.unwrap();
        assert_eq!(refreshed.version, "2.0.0");
        assert_eq!(refreshed.capabilities.len(), 1);
    }

    #[tokio::test]
    async fn test_handshake_refuses_incompatible_version() {
        let (pool, memory, _) = setup(PoolConfig::default());
        memory.register("reg", Registering::new(&["9.0"]));
        let desc = AgentDescriptor::new("reg", AgentType::Service, TransportConfig::in_process().with_handshake(true));
        let err = pool.acquire(&desc).await.err();
        assert!(matches!(
            err,
            Some(HiveError::Protocol(CodecError::UnsupportedVersion(_)))
        ));
    }

    #[tokio::test]
    async fn test_close_all() {
        let (pool, memory, _) = setup(PoolConfig::default());
        memory.register("a", Arc::new(Silent));
        let lease = pool.acquire(&descriptor("a")).await.unwrap();
        pool.release(lease).await;
        pool.close_all().await;
        assert_eq!(pool.idle_count("a"), 0);
        assert!(pool.acquire(&descriptor("a")).await.is_err());
    }

    fn handshaking(id: &str) -> AgentDescriptor {
        AgentDescriptor::new(id, AgentType::Service, TransportConfig::in_process().with_handshake(true))
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_keeps_answering_heartbeats() {
        let (pool, memory, directory) = setup(PoolConfig::default());
        memory.register("reg", Registering::beating(Duration::from_secs(2)));
        let lease = pool.acquire(&handshaking("reg")).await.unwrap();
        pool.release(lease).await;

        // 远超 interval × missed（30s）
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(directory.sweep().await.is_empty());
        assert_eq!(
            directory.discover(&CapabilityQuery::capability("SendEmail")).await.len(),
            1
        );
        assert_eq!(pool.idle_count("reg"), 1);

        // 借出时交回同一条连接
        let lease = pool.acquire(&handshaking("reg")).await.unwrap();
        assert_eq!(memory.connect_count("reg"), 1);
        pool.release(lease).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_on_idle_connection_deregisters_agent() {
        let (pool, memory, directory) = setup(PoolConfig::default());
        let agent = Arc::new(Leaving::default());
        memory.register("reg", agent.clone());
        let lease = pool.acquire(&handshaking("reg")).await.unwrap();
        pool.release(lease).await;
        assert!(directory.get("reg").await.is_some());

        agent.leave().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(directory.get("reg").await.is_none());
        assert_eq!(pool.idle_count("reg"), 0);

        // 重新连接时走新的握手
        let mut lease = pool.acquire(&handshaking("reg")).await.unwrap();
        assert!(lease.connection().unwrap().is_healthy());
        assert_eq!(memory.connect_count("reg"), 2);
        assert!(directory.get("reg").await.is_some());
    }
}
