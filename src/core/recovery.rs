//! 错误恢复引擎
//!
//! 根据 HiveError 类型返回 RecoveryAction，供重试包装器与编排器决定是重试、换 Agent 重试还是终止。
//! 可重试的只有连接类故障、超时与「Agent 忙」；协议错误、能力错误、取消一律不重试，
//! Agent 报告的执行失败仅在步骤声明幂等时重试。

use crate::core::{HiveError, RecoveryAction};
use crate::transport::TransportError;

/// 失败分类表：将错误映射为可执行动作
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// `retry_application_errors` 对应步骤的幂等声明
    pub fn handle(&self, err: &HiveError, retry_application_errors: bool) -> RecoveryAction {
        match err {
            HiveError::AgentBusy { .. } => RecoveryAction::Retry,
            HiveError::Transport(TransportError::Protocol(_)) => RecoveryAction::Abort,
            HiveError::Transport(TransportError::Unsupported(_)) => RecoveryAction::Abort,
            HiveError::Transport(_) => RecoveryAction::Failover,
            HiveError::StepTimeout(_) => RecoveryAction::Failover,
            HiveError::PoolExhausted(_) => RecoveryAction::Failover,
            HiveError::Application { .. } if retry_application_errors => RecoveryAction::Retry,
            _ => RecoveryAction::Abort,
        }
    }

    pub fn is_retryable(&self, err: &HiveError, retry_application_errors: bool) -> bool {
        self.handle(err, retry_application_errors) != RecoveryAction::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CodecError;
    use std::time::Duration;

    #[test]
    fn test_recovery_connect_failure() {
        let engine = RecoveryEngine::new();
        let err = HiveError::Transport(TransportError::Connect {
            agent_id: "a".into(),
            reason: "refused".into(),
        });
        assert_eq!(engine.handle(&err, false), RecoveryAction::Failover);
    }

    #[test]
    fn test_recovery_busy() {
        let engine = RecoveryEngine::new();
        let err = HiveError::AgentBusy { agent_id: "a".into() };
        assert_eq!(engine.handle(&err, false), RecoveryAction::Retry);
    }

    #[test]
    fn test_recovery_timeout() {
        let engine = RecoveryEngine::new();
        let err = HiveError::StepTimeout(Duration::from_secs(3));
        assert_eq!(engine.handle(&err, false), RecoveryAction::Failover);
    }

    #[test]
    fn test_recovery_protocol_never_retried() {
        let engine = RecoveryEngine::new();
        let err = HiveError::Protocol(CodecError::UnsupportedVersion("9.0".into()));
        assert_eq!(engine.handle(&err, true), RecoveryAction::Abort);
        let err = HiveError::Transport(TransportError::Protocol(CodecError::UnsupportedMessageKind(
            "X".into(),
        )));
        assert_eq!(engine.handle(&err, true), RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_application_error() {
        let engine = RecoveryEngine::new();
        let err = HiveError::Application {
            agent_id: "a".into(),
            code: "E".into(),
            message: "boom".into(),
        };
        assert_eq!(engine.handle(&err, false), RecoveryAction::Abort);
        assert_eq!(engine.handle(&err, true), RecoveryAction::Retry);
    }

    #[test]
    fn test_recovery_rejected_and_cancelled() {
        let engine = RecoveryEngine::new();
        let err = HiveError::Rejected {
            agent_id: "a".into(),
            message: "bad".into(),
        };
        assert!(!engine.is_retryable(&err, true));
        assert!(!engine.is_retryable(&HiveError::Cancelled, true));
        assert!(!engine.is_retryable(&HiveError::CircuitOpen("a".into()), true));
    }
}
