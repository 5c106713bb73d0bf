//! 事件流传输（SSE）
//!
//! 入站：对 `{endpoint}/events` 保持一条长连接，每个服务端事件的 data 即一条编码消息；
//! 出站：每条消息单独 POST 到 `{endpoint}/messages`，用 `X-Hive-Session` 头与事件流关联。
//! 事件流断开后按指数退避重连，携带 `Last-Event-ID` 续传。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::stdio::decode_frame;
use super::{
    ConnectOptions, Connection, TransportAdapter, TransportConfig, TransportError, TransportKind,
    TransportSession,
};
use crate::protocol::{Codec, Message};

/// 关联事件流与出站请求的会话头
pub const SESSION_HEADER: &str = "X-Hive-Session";

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(200);

/// SSE 适配器
#[derive(Debug, Clone)]
pub struct EventStreamTransport {
    client: reqwest::Client,
    max_reconnects: u32,
}

impl EventStreamTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            max_reconnects: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

async fn open_stream(
    client: &reqwest::Client,
    url: &str,
    session: &str,
    last_event_id: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Response, String> {
    let mut request = client
        .get(url)
        .header(SESSION_HEADER, session)
        .header(reqwest::header::ACCEPT, "text/event-stream");
    if let Some(id) = last_event_id {
        request = request.header("Last-Event-ID", id);
    }
    let response = tokio::time::timeout(timeout, request.send())
        .await
        .map_err(|_| format!("no response within {timeout:?}"))?
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("event stream returned HTTP {}", response.status()));
    }
    Ok(response)
}

#[async_trait]
impl TransportAdapter for EventStreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::EventStream
    }

    async fn connect(
        &self,
        agent_id: &str,
        config: &TransportConfig,
        options: &ConnectOptions,
    ) -> Result<Connection, TransportError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(|e| e.trim_end_matches('/').to_string())
            .ok_or_else(|| TransportError::connect(agent_id, "no endpoint configured"))?;
        let session_key = uuid::Uuid::new_v4().to_string();
        let events_url = format!("{endpoint}/events");

        let response = open_stream(
            &self.client,
            &events_url,
            &session_key,
            None,
            options.connect_timeout,
        )
        .await
        .map_err(|reason| TransportError::connect(agent_id, reason))?;
        tracing::info!(agent = %agent_id, "event stream opened: {}", events_url);

        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));
        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));

        let reader = StreamReader {
            client: self.client.clone(),
            url: events_url,
            session_key: session_key.clone(),
            agent_id: agent_id.to_string(),
            codec: options.codec.clone(),
            connect_timeout: options.connect_timeout,
            max_reconnects: self.max_reconnects,
            tx,
            cancel: cancel.clone(),
            alive: Arc::clone(&alive),
        };
        tokio::spawn(reader.run(response));

        let session = EventStreamSession {
            client: self.client.clone(),
            messages_url: format!("{endpoint}/messages"),
            session_key,
            send_timeout: options.connect_timeout,
            codec: options.codec.clone(),
            rx,
            cancel,
            alive,
        };
        Ok(Connection::new(agent_id, TransportKind::EventStream, Box::new(session)))
    }
}

struct StreamReader {
    client: reqwest::Client,
    url: String,
    session_key: String,
    agent_id: String,
    codec: Codec,
    connect_timeout: Duration,
    max_reconnects: u32,
    tx: mpsc::Sender<Result<Message, TransportError>>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl StreamReader {
    async fn run(self, first: reqwest::Response) {
        let mut response = Some(first);
        let mut last_event_id: Option<String> = None;

        'outer: loop {
            if let Some(resp) = response.take() {
                let mut events = resp.bytes_stream().eventsource();
                loop {
                    let next = tokio::select! {
                        _ = self.cancel.cancelled() => break 'outer,
                        next = events.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            if !event.id.is_empty() {
                                last_event_id = Some(event.id.clone());
                            }
                            if event.data.trim().is_empty() {
                                continue;
                            }
                            let item = decode_frame(&self.codec, &self.agent_id, event.data.as_bytes());
                            if self.tx.send(item).await.is_err() {
                                break 'outer;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(agent = %self.agent_id, "event stream error: {}", e);
                            break;
                        }
                        None => {
                            tracing::debug!(agent = %self.agent_id, "event stream ended");
                            break;
                        }
                    }
                }
            }

            // 重连：指数退避，带 Last-Event-ID
            let mut attempt = 0;
            while response.is_none() {
                if attempt >= self.max_reconnects {
                    tracing::warn!(
                        agent = %self.agent_id,
                        "event stream lost after {} reconnect attempts",
                        attempt
                    );
                    let _ = self
                        .tx
                        .send(Err(TransportError::Receive("event stream lost".into())))
                        .await;
                    break 'outer;
                }
                let delay = RECONNECT_BASE_DELAY * 2u32.saturating_pow(attempt);
                tokio::select! {
                    _ = self.cancel.cancelled() => break 'outer,
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
                match open_stream(
                    &self.client,
                    &self.url,
                    &self.session_key,
                    last_event_id.as_deref(),
                    self.connect_timeout,
                )
                .await
                {
                    Ok(resp) => {
                        tracing::info!(agent = %self.agent_id, attempt, "event stream reconnected");
                        response = Some(resp);
                    }
                    Err(reason) => {
                        tracing::debug!(agent = %self.agent_id, attempt, "reconnect failed: {}", reason)
                    }
                }
            }
        }
        self.alive.store(false, Ordering::SeqCst);
    }
}

struct EventStreamSession {
    client: reqwest::Client,
    messages_url: String,
    session_key: String,
    send_timeout: Duration,
    codec: Codec,
    rx: mpsc::Receiver<Result<Message, TransportError>>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSession for EventStreamSession {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let body = self.codec.encode(message)?;
        let request = self
            .client
            .post(&self.messages_url)
            .header(SESSION_HEADER, &self.session_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        let response = tokio::time::timeout(self.send_timeout, request.send())
            .await
            .map_err(|_| TransportError::Timeout(self.send_timeout))?
            .map_err(|e| TransportError::Send(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Send(format!(
                "agent returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message, TransportError> {
        self.rx.recv().await.unwrap_or(Err(TransportError::Closed))
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_healthy(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }
}
