//! 编排核心错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 HiveError 的分类决定 Retry / Failover / Abort。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::DirectoryError;
use crate::planner::PlanError;
use crate::protocol::CodecError;
use crate::transport::TransportError;

/// 编排过程中可能出现的错误（传输、协议、能力、超时、Agent 执行失败等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HiveError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("no agent provides capability '{0}'")]
    NoCapableAgent(String),

    #[error("agent {agent_id} rejected parameters: {message}")]
    Rejected { agent_id: String, message: String },

    #[error("agent {agent_id} is busy")]
    AgentBusy { agent_id: String },

    #[error("agent {agent_id} failed: [{code}] {message}")]
    Application {
        agent_id: String,
        code: String,
        message: String,
    },

    #[error("step timed out after {0:?}")]
    StepTimeout(Duration),

    #[error("circuit open for agent {0}")]
    CircuitOpen(String),

    #[error("connection pool exhausted for agent {0}")]
    PoolExhausted(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    Transport,
    Protocol,
    Capability,
    Timeout,
    Application,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transport => "TransportError",
            ErrorClass::Protocol => "ProtocolError",
            ErrorClass::Capability => "CapabilityError",
            ErrorClass::Timeout => "Timeout",
            ErrorClass::Application => "ApplicationError",
            ErrorClass::Cancelled => "Cancelled",
            ErrorClass::Internal => "InternalError",
        };
        f.write_str(s)
    }
}

impl HiveError {
    pub fn class(&self) -> ErrorClass {
        match self {
            HiveError::Transport(TransportError::Protocol(_)) => ErrorClass::Protocol,
            HiveError::Transport(TransportError::Timeout(_)) => ErrorClass::Timeout,
            HiveError::Transport(_) | HiveError::PoolExhausted(_) | HiveError::CircuitOpen(_) => {
                ErrorClass::Transport
            }
            HiveError::AgentBusy { .. } => ErrorClass::Transport,
            HiveError::Protocol(_) => ErrorClass::Protocol,
            HiveError::NoCapableAgent(_) | HiveError::Rejected { .. } => ErrorClass::Capability,
            HiveError::Plan(PlanError::UnplannableIntent { .. }) => ErrorClass::Capability,
            HiveError::StepTimeout(_) => ErrorClass::Timeout,
            HiveError::Application { .. } => ErrorClass::Application,
            HiveError::Cancelled => ErrorClass::Cancelled,
            HiveError::Directory(_)
            | HiveError::Plan(_)
            | HiveError::Config(_)
            | HiveError::Internal(_) => ErrorClass::Internal,
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 在同一 Agent 上退避后重试（如 Agent 忙）
    Retry,
    /// 退避后重试，优先换一个 Agent（连接失败、超时）
    Failover,
    /// 不重试，直接判定失败
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = HiveError::Transport(TransportError::Connect {
            agent_id: "a".into(),
            reason: "refused".into(),
        });
        assert_eq!(err.class(), ErrorClass::Transport);
        assert_eq!(err.class().to_string(), "TransportError");

        let err = HiveError::Transport(TransportError::Protocol(CodecError::UnsupportedMessageKind(
            "X".into(),
        )));
        assert_eq!(err.class(), ErrorClass::Protocol);
        assert_eq!(HiveError::StepTimeout(Duration::from_secs(1)).class(), ErrorClass::Timeout);
        assert_eq!(HiveError::NoCapableAgent("x".into()).class(), ErrorClass::Capability);
        assert_eq!(HiveError::Cancelled.class(), ErrorClass::Cancelled);
    }
}
