//! 意图模型与外部推理服务接口
//!
//! 自由文本交给推理服务解析为 [`IntentModel`]；声明式工作流（JSON / TOML）直接反序列化为同一结构。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// 推理服务错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("inference service unavailable: {0}")]
    Unavailable(String),

    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid inference response: {0}")]
    InvalidResponse(String),
}

/// 意图中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentStep {
    #[serde(default)]
    pub id: String,
    pub capability: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub idempotent: bool,
    /// 未指定时取 Agent 能力声明的超时
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub order: Option<u32>,
}

impl IntentStep {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            parameters: Map::new(),
            depends_on: Vec::new(),
            optional: false,
            idempotent: false,
            timeout_seconds: None,
            order: None,
        }
    }

    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }
}

/// 解析后的意图：目标 + 所需能力步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct IntentModel {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<IntentStep>,
}

impl IntentModel {
    pub fn new(goal: impl Into<String>, steps: Vec<IntentStep>) -> Self {
        Self {
            goal: goal.into(),
            steps,
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self, String> {
        serde_json::from_str(s).map_err(|e| e.to_string())
    }

    pub fn from_toml_str(s: &str) -> Result<Self, String> {
        toml::from_str(s).map_err(|e| e.to_string())
    }
}

/// 外部推理服务：`completeIntent(text, context) -> plan-hints`
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn complete_intent(&self, text: &str, context: &Value) -> Result<IntentModel, InferenceError>;
}

/// HTTP 推理客户端：POST `{ text, context }`，响应体即 IntentModel
#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpInferenceClient {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn complete_intent(&self, text: &str, context: &Value) -> Result<IntentModel, InferenceError> {
        let body = serde_json::json!({ "text": text, "context": context });
        let request = self.client.post(&self.endpoint).json(&body).send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| InferenceError::Timeout(self.timeout))?
            .map_err(|e| {
                if e.is_timeout() {
                    InferenceError::Timeout(self.timeout)
                } else {
                    InferenceError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(InferenceError::Unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(InferenceError::InvalidResponse(format!("HTTP {status}")));
        }
        response
            .json::<IntentModel>()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))
    }
}

/// 固定返回同一意图的客户端（测试与离线运行）
#[derive(Debug, Clone, Default)]
pub struct StaticInferenceClient {
    intent: Option<IntentModel>,
}

impl StaticInferenceClient {
    pub fn new(intent: IntentModel) -> Self {
        Self {
            intent: Some(intent),
        }
    }

    /// 始终返回 Unavailable
    pub fn unavailable() -> Self {
        Self { intent: None }
    }
}

#[async_trait]
impl InferenceClient for StaticInferenceClient {
    async fn complete_intent(&self, text: &str, _context: &Value) -> Result<IntentModel, InferenceError> {
        match &self.intent {
            Some(intent) => {
                let mut intent = intent.clone();
                if intent.goal.is_empty() {
                    intent.goal = text.to_string();
                }
                Ok(intent)
            }
            None => Err(InferenceError::Unavailable("no inference backend configured".into())),
        }
    }
}
