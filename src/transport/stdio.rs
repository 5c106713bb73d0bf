//! 子进程 stdio 传输
//!
//! 以子进程方式启动 Agent，通过 stdin/stdout 交换按行分隔的编码消息；
//! 负责进程生命周期：启动、监视退出码、关闭时 kill。stderr 输出进入 debug 日志。
//!
//! stdout 按字节分帧，单帧不超过 [`MAX_FRAME_BYTES`]：超长或无法解码的行作为协议错误交给上层，
//! 读循环继续。进程退出后接收返回带退出码的错误。

use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{
    ConnectOptions, Connection, TransportAdapter, TransportConfig, TransportError, TransportKind,
    TransportSession, MAX_FRAME_BYTES,
};
use crate::protocol::{Codec, CodecError, Message};

/// 关闭时等待子进程退出的上限
const KILL_GRACE: Duration = Duration::from_secs(2);

/// stdout 关闭后等待退出码的上限
const EXIT_WAIT: Duration = Duration::from_secs(1);

enum Frame {
    Line,
    /// 超出上限的行，只保留前 max 字节
    Oversized(usize),
    Eof,
}

/// 读取一行（不含 `\n`）到 `buf`；超过 `max` 的部分读出后丢弃
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut dropped = 0usize;
    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(match (buf.is_empty(), dropped) {
                    (true, 0) => Frame::Eof,
                    (_, 0) => Frame::Line,
                    (_, n) => Frame::Oversized(buf.len() + n),
                });
            }
            let (line, used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (&available[..i], i + 1, true),
                None => (available, available.len(), false),
            };
            let keep = line.len().min(max.saturating_sub(buf.len()));
            buf.extend_from_slice(&line[..keep]);
            dropped += line.len() - keep;
            (used, done)
        };
        reader.consume(used);
        if done {
            return Ok(if dropped == 0 {
                Frame::Line
            } else {
                Frame::Oversized(buf.len() + dropped)
            });
        }
    }
}

/// 子进程 stdio 适配器
#[derive(Debug, Default)]
pub struct StdioTransport;

impl StdioTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportAdapter for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(
        &self,
        agent_id: &str,
        config: &TransportConfig,
        options: &ConnectOptions,
    ) -> Result<Connection, TransportError> {
        let program = config
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| TransportError::connect(agent_id, "no command configured"))?;

        let mut child = Command::new(program)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::connect(agent_id, format!("failed to spawn {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::connect(agent_id, "stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::connect(agent_id, "stdout unavailable"))?;
        let stderr = child.stderr.take();

        tracing::info!(agent = %agent_id, pid = ?child.id(), "spawned agent process: {}", program);

        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));
        let exit_code = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel(options.channel_capacity.max(1));

        // stdout：逐行解码后送入有界通道
        {
            let cancel = cancel.clone();
            let alive = Arc::clone(&alive);
            let codec = options.codec.clone();
            let agent = agent_id.to_string();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                let mut buf = Vec::new();
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => break,
                        frame = read_frame(&mut reader, &mut buf, MAX_FRAME_BYTES) => frame,
                    };
                    let item = match frame {
                        Ok(Frame::Line) => {
                            if buf.iter().all(u8::is_ascii_whitespace) {
                                continue;
                            }
                            decode_frame(&codec, &agent, &buf)
                        }
                        Ok(Frame::Oversized(len)) => {
                            tracing::error!(agent = %agent, len, "agent sent an oversized frame");
                            Err(TransportError::Protocol(CodecError::malformed(
                                format!("frame of {len} bytes exceeds limit of {MAX_FRAME_BYTES}"),
                                &buf,
                            )))
                        }
                        Ok(Frame::Eof) => {
                            tracing::debug!(agent = %agent, "agent stdout closed");
                            break;
                        }
                        Err(e) => {
                            let _ = tx.send(Err(TransportError::Receive(e.to_string()))).await;
                            break;
                        }
                    };
                    if tx.send(item).await.is_err() {
                        break;
                    }
                }
                alive.store(false, Ordering::SeqCst);
            });
        }

        if let Some(stderr) = stderr {
            let agent = agent_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(agent = %agent, "[agent stderr] {}", line.trim_end());
                }
            });
        }

        // 进程监视：记录退出码；取消时 kill
        let supervisor = {
            let cancel = cancel.clone();
            let alive = Arc::clone(&alive);
            let exit_code = Arc::clone(&exit_code);
            let agent = agent_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => {
                        alive.store(false, Ordering::SeqCst);
                        match status {
                            Ok(status) => {
                                if let Ok(mut code) = exit_code.lock() {
                                    *code = status.code();
                                }
                                tracing::warn!(agent = %agent, code = ?status.code(), "agent process exited");
                            }
                            Err(e) => tracing::warn!(agent = %agent, "failed to wait on agent process: {}", e),
                        }
                    }
                    _ = cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            tracing::debug!(agent = %agent, "kill agent process: {}", e);
                        }
                        if let Ok(mut code) = exit_code.lock() {
                            *code = child.try_wait().ok().flatten().and_then(|s| s.code());
                        }
                        alive.store(false, Ordering::SeqCst);
                    }
                }
            })
        };

        let session = StdioSession {
            stdin: Some(stdin),
            rx,
            codec: options.codec.clone(),
            alive,
            exit_code,
            cancel: cancel.clone(),
            supervisor: Some(supervisor),
            _guard: cancel.drop_guard(),
        };
        Ok(Connection::new(agent_id, TransportKind::Stdio, Box::new(session)))
    }
}

pub(crate) fn decode_frame(
    codec: &Codec,
    agent_id: &str,
    frame: &[u8],
) -> Result<Message, TransportError> {
    codec.decode(frame).map_err(|e| {
        tracing::error!(agent = %agent_id, raw = ?e.raw(), "rejected inbound frame: {}", e);
        TransportError::Protocol(e)
    })
}

struct StdioSession {
    stdin: Option<ChildStdin>,
    rx: mpsc::Receiver<Result<Message, TransportError>>,
    codec: Codec,
    alive: Arc<AtomicBool>,
    exit_code: Arc<Mutex<Option<i32>>>,
    cancel: CancellationToken,
    supervisor: Option<JoinHandle<()>>,
    _guard: DropGuard,
}

impl StdioSession {
    fn exit_code(&self) -> Option<i32> {
        self.exit_code.lock().ok().and_then(|c| *c)
    }

    /// stdout 已关闭：短暂等待进程退出，带上退出码
    async fn exited(&mut self) -> TransportError {
        if let Some(handle) = self.supervisor.as_mut() {
            if tokio::time::timeout(EXIT_WAIT, handle).await.is_ok() {
                self.supervisor = None;
            }
        }
        match self.exit_code() {
            Some(code) => TransportError::Receive(format!("agent process exited with status {code}")),
            None => TransportError::Closed,
        }
    }
}

#[async_trait]
impl TransportSession for StdioSession {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        let mut frame = self.codec.encode(message)?;
        frame.push(b'\n');
        stdin
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn receive(&mut self) -> Result<Message, TransportError> {
        match self.rx.recv().await {
            Some(item) => item,
            None => Err(self.exited().await),
        }
    }

    async fn close(&mut self) {
        // 先关闭 stdin，给 Agent 一次自行退出的机会
        self.stdin.take();
        self.cancel.cancel();
        if let Some(handle) = self.supervisor.take() {
            let _ = tokio::time::timeout(KILL_GRACE, handle).await;
        }
    }

    fn is_healthy(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }
}
