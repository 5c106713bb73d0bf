//! 执行上下文：将运行中的计划与会话、用户、共享数据和取消信号关联
//!
//! 计划级取消令牌，每个步骤使用其子 token；取消计划即取消所有在途步骤。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 计划执行上下文（可廉价克隆，所有克隆共享同一份 scratch 与取消信号）
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    session_id: String,
    user_id: String,
    /// 所有步骤可见的共享键值数据
    scratch: Arc<RwLock<HashMap<String, Value>>>,
    cancel_token: CancellationToken,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            scratch: Arc::new(RwLock::new(HashMap::new())),
            cancel_token: CancellationToken::new(),
        }
    }

    /// 新会话（随机 session id）
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self::new(format!("session_{}", uuid::Uuid::new_v4()), user_id)
    }

    /// 挂到外部取消信号下（如进程关闭）
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel_token = parent.child_token();
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.scratch.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        self.scratch.write().await.insert(key.into(), value);
    }

    pub async fn scratch_snapshot(&self) -> Map<String, Value> {
        self.scratch
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// 推理服务与步骤派发使用的上下文描述
    pub async fn to_json(&self) -> Value {
        serde_json::json!({
            "sessionId": self.session_id,
            "userId": self.user_id,
            "scratch": Value::Object(self.scratch_snapshot().await),
        })
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发计划级取消
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 单个步骤用的子 token
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::for_user("anonymous")
    }
}
