//! 分块 HTTP 传输
//!
//! 对 `{endpoint}/stream` 发起一个 POST：请求体是持续写入的换行分隔消息流，
//! 响应体同样按行分帧，一行一条消息。请求与响应在同一对流上双向并行。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::event_stream::SESSION_HEADER;
use super::stdio::decode_frame;
use super::{
    ConnectOptions, Connection, TransportAdapter, TransportConfig, TransportError, TransportKind,
    TransportSession, MAX_FRAME_BYTES,
};
use crate::protocol::{Codec, Message};

/// 把任意切分的字节块还原为按 `\n` 分隔的帧
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_frame: usize,
}

impl LineFramer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    /// 追加一块数据，返回其中完整的帧（空行被跳过）
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                frames.push(line);
            }
        }
        if self.buf.len() > self.max_frame {
            self.buf.clear();
            return Err(TransportError::Receive(format!(
                "frame exceeds {} bytes",
                self.max_frame
            )));
        }
        Ok(frames)
    }
}

/// 分块 HTTP 适配器
#[derive(Debug, Clone)]
pub struct ChunkedHttpTransport {
    client: reqwest::Client,
}

impl ChunkedHttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransportAdapter for ChunkedHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ChunkedHttp
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
            .map(|e| e.trim_end_matches('/'))
            .ok_or_else(|| TransportError::connect(agent_id, "no endpoint configured"))?;
        let url = format!("{endpoint}/stream");

        let capacity = options.channel_capacity.max(1);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let body_stream = futures_util::stream::unfold(out_rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|frame| (Ok::<_, std::io::Error>(frame), rx))
        });

        let request = self
            .client
            .post(&url)
            .header(SESSION_HEADER, uuid::Uuid::new_v4().to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(reqwest::Body::wrap_stream(body_stream));

        // Agent 必须在读完请求体之前先返回响应头
        let response = tokio::time::timeout(options.connect_timeout, request.send())
            .await
            .map_err(|_| {
                TransportError::connect(agent_id, format!("no response within {:?}", options.connect_timeout))
            })?
            .map_err(|e| TransportError::connect(agent_id, e))?;
        if !response.status().is_success() {
            return Err(TransportError::connect(
                agent_id,
                format!("stream endpoint returned HTTP {}", response.status()),
            ));
        }
        tracing::info!(agent = %agent_id, "chunked stream opened: {}", url);

        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));
        {
            let cancel = cancel.clone();
            let alive = Arc::clone(&alive);
            let codec = options.codec.clone();
            let agent = agent_id.to_string();
            tokio::spawn(async move {
                let mut chunks = response.bytes_stream();
                let mut framer = LineFramer::new(MAX_FRAME_BYTES);
                'read: loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = chunks.next() => next,
                    };
                    let chunk = match next {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(e)) => {
                            let _ = tx.send(Err(TransportError::Receive(e.to_string()))).await;
                            break;
                        }
                        None => {
                            tracing::debug!(agent = %agent, "chunked stream ended");
                            break;
                        }
                    };
                    match framer.push(&chunk) {
                        Ok(frames) => {
                            for frame in frames {
                                if tx.send(decode_frame(&codec, &agent, &frame)).await.is_err() {
                                    break 'read;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(agent = %agent, "{}", e);
                            let _ = tx.send(Err(e)).await;
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
            });
        }

        let session = ChunkedSession {
            out: Some(out_tx),
            rx,
            codec: options.codec.clone(),
            cancel,
            alive,
        };
        Ok(Connection::new(agent_id, TransportKind::ChunkedHttp, Box::new(session)))
    }
}

struct ChunkedSession {
    out: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Result<Message, TransportError>>,
    codec: Codec,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSession for ChunkedSession {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let out = self.out.as_ref().ok_or(TransportError::Closed)?;
        let mut frame = self.codec.encode(message)?;
        frame.push(b'\n');
        out.send(frame).await.map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<Message, TransportError> {
        self.rx.recv().await.unwrap_or(Err(TransportError::Closed))
    }

    async fn close(&mut self) {
        // 结束请求体，Agent 随之结束响应
        self.out.take();
        self.cancel.cancel();
    }

    fn is_healthy(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
            && self.out.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framer_split_chunks() {
        let mut framer = LineFramer::new(1024);
        assert!(framer.push(b"{\"a\":").unwrap().is_empty());
        let frames = framer.push(b"1}\n\n{\"b\":2}\r\n{\"c\"").unwrap();
        assert_eq!(frames, vec![b"{\"a\":1}".to_vec(), b"{\"b\":2}".to_vec()]);
        let frames = framer.push(b":3}\n").unwrap();
        assert_eq!(frames, vec![b"{\"c\":3}".to_vec()]);
    }

    #[test]
    fn test_framer_oversized() {
        let mut framer = LineFramer::new(8);
        let err = framer.push(b"0123456789").unwrap_err();
        assert!(matches!(err, TransportError::Receive(_)));
        // 溢出后缓冲被清空，可继续使用
        assert_eq!(framer.push(b"ok\n").unwrap(), vec![b"ok".to_vec()]);
    }
}
