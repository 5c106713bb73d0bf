//! 单次派发：借连接、发送 CommandRequest、等待关联的响应
//!
//! 等待期间同一连接上还会收到心跳与进度：心跳刷新目录并回复 HeartbeatAck，
//! 进度经有界通道交给监控（满则丢弃）。Agent 发来 Disconnect 时注销该 Agent 并清空其空闲连接。步骤超时与计划取消时尽力发送 Cancel，
//! 在宽限期内等待确认后丢弃连接；其余情况连接归还连接池。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{DispatchId, HiveError};
use crate::directory::{AgentDescriptor, AgentDirectory};
use crate::monitor::{ProgressEvent, ProgressReporter};
use crate::planner::TaskStep;
use crate::pool::{answer_heartbeat, outbound, ConnectionLease, ConnectionPool};
use crate::protocol::{
    CancelPayload, CommandRequestPayload, CommandResponsePayload, ExecutionStatus, Message,
    MessageBody, ERROR_CODE_BUSY, ERROR_CODE_REJECTED,
};
use crate::transport::{Connection, TransportError};

/// 步骤参数中携带会话上下文（sessionId / userId / scratch）的键
pub const CONTEXT_PARAMETER: &str = "context";

/// 一次派发的输入
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    pub dispatch_id: DispatchId,
    pub plan_id: &'a str,
    pub session_id: &'a str,
    pub step: &'a TaskStep,
    pub agent: &'a AgentDescriptor,
    pub attempt: u32,
    /// 派发时刻的上下文快照
    pub context: &'a Value,
}

enum Wait {
    Done(Result<Value, HiveError>),
    Cancelled,
    TimedOut,
}

/// 派发器
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    directory: Arc<AgentDirectory>,
    progress: ProgressReporter,
    cancel_grace: Duration,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<ConnectionPool>,
        directory: Arc<AgentDirectory>,
        progress: ProgressReporter,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            pool,
            directory,
            progress,
            cancel_grace,
        }
    }

    /// 执行一次能力调用；请求发出后调用 `on_sent`（步骤进入 Running）
    pub async fn dispatch(
        &self,
        request: DispatchRequest<'_>,
        cancel: &CancellationToken,
        on_sent: impl FnOnce(),
    ) -> Result<Value, HiveError> {
        let start = Instant::now();
        let result = self.dispatch_inner(request, cancel, on_sent).await;

        let outcome = match &result {
            Ok(_) => "ok".to_string(),
            Err(e) => e.class().to_string(),
        };
        let audit = serde_json::json!({
            "event": "dispatch_audit",
            "dispatch": request.dispatch_id.value(),
            "plan": request.plan_id,
            "step": request.step.id,
            "agent": request.agent.agent_id,
            "capability": request.step.target_capability,
            "attempt": request.attempt,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "dispatch");
        result
    }

    async fn dispatch_inner(
        &self,
        request: DispatchRequest<'_>,
        cancel: &CancellationToken,
        on_sent: impl FnOnce(),
    ) -> Result<Value, HiveError> {
        let agent_id = request.agent.agent_id.as_str();
        let mut lease = tokio::select! {
            _ = cancel.cancelled() => return Err(HiveError::Cancelled),
            lease = self.pool.acquire(request.agent) => lease?,
        };

        let step = request.step;
        let timeout = step.timeout();
        let report_progress = request
            .agent
            .capability(&step.target_capability)
            .map(|c| c.supports_progress)
            .unwrap_or(false);

        let mut parameters = step.parameters.clone();
        parameters.insert(CONTEXT_PARAMETER.to_string(), request.context.clone());

        let sent = {
            let conn = lease.connection()?;
            let message = outbound(
                conn,
                request.session_id,
                MessageBody::CommandRequest(CommandRequestPayload {
                    target_agent_id: agent_id.to_string(),
                    capability_name: step.target_capability.clone(),
                    parameters,
                    timeout_seconds: timeout.as_secs(),
                    run_async: false,
                    report_progress,
                }),
            );
            conn.send(&message).await.map(|()| message)
        };
        let message = match sent {
            Ok(message) => message,
            Err(e) => {
                self.pool.discard(lease, "send failed").await;
                return Err(e.into());
            }
        };
        tracing::debug!(agent = %agent_id, step = %step.id, request = %message.id, "command sent");
        on_sent();

        let mut execution_id = None;
        let deadline = Instant::now() + timeout;
        let wait = {
            let conn = lease.connection()?;
            tokio::select! {
                _ = cancel.cancelled() => Wait::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wait::TimedOut,
                done = self.await_response(conn, &request, &message, &mut execution_id) => Wait::Done(done),
            }
        };

        match wait {
            Wait::Done(result) => {
                // 连接层失败后状态未知，不再复用
                let reusable = !matches!(result, Err(HiveError::Transport(_)));
                if reusable {
                    self.pool.release(lease).await;
                } else {
                    self.pool.discard(lease, "transport failure").await;
                }
                result
            }
            Wait::Cancelled => {
                self.notify_cancel(&mut lease, &message, execution_id, "plan cancelled")
                    .await;
                self.pool.discard(lease, "cancelled").await;
                Err(HiveError::Cancelled)
            }
            Wait::TimedOut => {
                tracing::warn!(agent = %agent_id, step = %step.id, "step timed out after {:?}", timeout);
                self.notify_cancel(&mut lease, &message, execution_id, "step timeout")
                    .await;
                self.pool.discard(lease, "step timeout").await;
                Err(HiveError::StepTimeout(timeout))
            }
        }
    }

    /// 读取直到收到与请求关联的终态响应
    async fn await_response(
        &self,
        conn: &mut Connection,
        request: &DispatchRequest<'_>,
        sent: &Message,
        execution_id: &mut Option<String>,
    ) -> Result<Value, HiveError> {
        let agent_id = request.agent.agent_id.as_str();
        loop {
            let incoming = conn.receive().await?;
            match incoming.body {
                MessageBody::CommandResponse(ref response)
                    if incoming.correlation_id.as_deref() == Some(sent.id.as_str()) =>
                {
                    if !response.status.is_terminal() {
                        tracing::debug!(agent = %agent_id, status = ?response.status, "command in progress");
                        *execution_id = Some(response.execution_id.clone());
                        continue;
                    }
                    return map_response(agent_id, response.clone(), request.step.timeout());
                }
                MessageBody::CommandResponse(_) => {
                    tracing::debug!(
                        agent = %agent_id,
                        correlation = ?incoming.correlation_id,
                        "ignoring response to another request"
                    );
                }
                MessageBody::Heartbeat(ref heartbeat) => {
                    answer_heartbeat(&self.directory, conn, &incoming, heartbeat).await?;
                }
                MessageBody::ProgressUpdate(update) => {
                    let known = incoming.correlation_id.as_deref() == Some(sent.id.as_str())
                        || execution_id.as_deref() == Some(update.execution_id.as_str());
                    if !known {
                        continue;
                    }
                    let delivered = self.progress.report(ProgressEvent {
                        plan_id: request.plan_id.to_string(),
                        step_id: request.step.id.clone(),
                        agent_id: agent_id.to_string(),
                        update,
                    });
                    if !delivered {
                        tracing::debug!(agent = %agent_id, "progress update dropped");
                    }
                }
                MessageBody::Disconnect(ref bye) => {
                    tracing::warn!(agent = %agent_id, "agent disconnected mid-request: {}", bye.reason);
                    self.pool.agent_disconnected(agent_id, &bye.reason).await;
                    return Err(TransportError::Closed.into());
                }
                _ => {
                    tracing::warn!(agent = %agent_id, kind = %incoming.kind(), "unexpected message while awaiting response");
                }
            }
        }
    }

    /// 尽力通知 Agent 取消，在宽限期内等待其确认
    async fn notify_cancel(
        &self,
        lease: &mut ConnectionLease,
        sent: &Message,
        execution_id: Option<String>,
        reason: &str,
    ) {
        let Ok(conn) = lease.connection() else { return };
        let notice = outbound(
            conn,
            &sent.session_id,
            MessageBody::Cancel(CancelPayload {
                execution_id: execution_id.unwrap_or_else(|| sent.id.clone()),
                reason: reason.to_string(),
            }),
        )
        .correlated_to(sent.id.clone());

        let acked = tokio::time::timeout(self.cancel_grace, async {
            conn.send(&notice).await?;
            loop {
                let incoming = conn.receive().await?;
                if let MessageBody::CommandResponse(response) = &incoming.body {
                    if incoming.correlation_id.as_deref() == Some(sent.id.as_str())
                        && response.status.is_terminal()
                    {
                        return Ok::<_, TransportError>(response.status);
                    }
                }
            }
        })
        .await;
        match acked {
            Ok(Ok(status)) => {
                tracing::debug!(agent = %conn.agent_id(), status = ?status, "cancel acknowledged")
            }
            Ok(Err(e)) => tracing::debug!(agent = %conn.agent_id(), "cancel notice failed: {}", e),
            Err(_) => tracing::debug!(
                agent = %conn.agent_id(),
                "no cancel acknowledgement within {:?}",
                self.cancel_grace
            ),
        }
    }
}

/// 终态响应 -> 结果；按约定错误码区分忙、参数拒绝与一般失败
fn map_response(
    agent_id: &str,
    response: CommandResponsePayload,
    timeout: Duration,
) -> Result<Value, HiveError> {
    match response.status {
        ExecutionStatus::Completed => Ok(response.result.unwrap_or(Value::Null)),
        ExecutionStatus::Timeout => Err(HiveError::StepTimeout(timeout)),
        status => {
            let (code, message) = match response.error {
                Some(e) => (e.code, e.message),
                None => (format!("{status:?}").to_uppercase(), String::new()),
            };
            match code.as_str() {
                ERROR_CODE_BUSY => Err(HiveError::AgentBusy {
                    agent_id: agent_id.to_string(),
                }),
                ERROR_CODE_REJECTED => Err(HiveError::Rejected {
                    agent_id: agent_id.to_string(),
                    message,
                }),
                _ => Err(HiveError::Application {
                    agent_id: agent_id.to_string(),
                    code,
                    message,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorPayload;

    fn response(status: ExecutionStatus, error: Option<(&str, &str)>) -> CommandResponsePayload {
        CommandResponsePayload {
            execution_id: "e1".into(),
            status,
            result: Some(serde_json::json!({"sent": true})),
            error: error.map(|(code, message)| ErrorPayload {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    #[test]
    fn test_map_response() {
        let t = Duration::from_secs(5);
        assert_eq!(
            map_response("a", response(ExecutionStatus::Completed, None), t),
            Ok(serde_json::json!({"sent": true}))
        );
        assert_eq!(
            map_response("a", response(ExecutionStatus::Failed, Some((ERROR_CODE_BUSY, ""))), t),
            Err(HiveError::AgentBusy { agent_id: "a".into() })
        );
        assert!(matches!(
            map_response("a", response(ExecutionStatus::Failed, Some((ERROR_CODE_REJECTED, "bad"))), t),
            Err(HiveError::Rejected { .. })
        ));
        assert!(matches!(
            map_response("a", response(ExecutionStatus::Failed, Some(("SMTP_DOWN", "no relay"))), t),
            Err(HiveError::Application { ref code, .. }) if code == "SMTP_DOWN"
        ));
        assert_eq!(
            map_response("a", response(ExecutionStatus::Timeout, None), t),
            Err(HiveError::StepTimeout(t))
        );
        assert!(matches!(
            map_response("a", response(ExecutionStatus::Cancelled, None), t),
            Err(HiveError::Application { ref code, .. }) if code == "CANCELLED"
        ));
    }
}
