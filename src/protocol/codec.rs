//! 消息编解码
//!
//! 线上格式为单个 JSON 对象（camelCase 信封 + `payload`）。解码先校验信封完整性
//! （id / kind / protocolVersion），再按 kind 解析 payload；未知顶层字段并入 metadata。
//! 未知 kind 返回 `UnsupportedMessageKind`，校验失败返回 `MalformedMessage`，均不会交给业务层。

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use super::message::*;

/// 诊断日志里保留的原始报文最大长度
const RAW_PREVIEW_CHARS: usize = 512;

const ENVELOPE_FIELDS: [&str; 10] = [
    "id",
    "kind",
    "protocolVersion",
    "timestamp",
    "senderId",
    "receiverId",
    "sessionId",
    "priority",
    "correlationId",
    "metadata",
];

/// 编解码错误（协议错误，永不重试）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String, raw: String },

    #[error("unsupported message kind: {0}")]
    UnsupportedMessageKind(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>, raw: &[u8]) -> Self {
        CodecError::MalformedMessage {
            reason: reason.into(),
            raw: raw_preview(raw),
        }
    }

    /// 原始报文（截断），便于诊断
    pub fn raw(&self) -> Option<&str> {
        match self {
            CodecError::MalformedMessage { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

fn raw_preview(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    if s.chars().count() > RAW_PREVIEW_CHARS {
        format!("{}...", s.chars().take(RAW_PREVIEW_CHARS).collect::<String>())
    } else {
        s.into_owned()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope<'a> {
    id: &'a str,
    kind: &'static str,
    protocol_version: &'a str,
    timestamp: &'a DateTime<Utc>,
    sender_id: &'a str,
    receiver_id: &'a str,
    session_id: &'a str,
    priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
    metadata: &'a Map<String, Value>,
    payload: Value,
}

/// 带版本约束的编解码器
#[derive(Debug, Clone)]
pub struct Codec {
    supported_versions: Vec<String>,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(vec![PROTOCOL_VERSION.to_string()])
    }
}

impl Codec {
    pub fn new(supported_versions: Vec<String>) -> Self {
        Self { supported_versions }
    }

    pub fn supported_versions(&self) -> &[String] {
        &self.supported_versions
    }

    /// 主版本号相同即视为可解码
    pub fn accepts_version(&self, version: &str) -> bool {
        let major = parse_version(version).map(|(m, _)| m);
        major.is_some()
            && self
                .supported_versions
                .iter()
                .any(|v| parse_version(v).map(|(m, _)| m) == major)
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let payload = encode_payload(&message.body).map_err(|e| CodecError::Encode(e.to_string()))?;
        let wire = WireEnvelope {
            id: &message.id,
            kind: message.kind().as_str(),
            protocol_version: &message.protocol_version,
            timestamp: &message.timestamp,
            sender_id: &message.sender_id,
            receiver_id: &message.receiver_id,
            session_id: &message.session_id,
            priority: message.priority,
            correlation_id: message.correlation_id.as_deref(),
            metadata: &message.metadata,
            payload,
        };
        serde_json::to_vec(&wire).map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Message, CodecError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| CodecError::malformed(format!("invalid JSON: {e}"), bytes))?;
        let Value::Object(mut obj) = value else {
            return Err(CodecError::malformed("envelope is not an object", bytes));
        };

        let id = take_required_str(&mut obj, "id", bytes)?;
        let kind_str = take_required_str(&mut obj, "kind", bytes)?;
        let protocol_version = take_required_str(&mut obj, "protocolVersion", bytes)?;

        let kind: MessageKind = kind_str
            .parse()
            .map_err(CodecError::UnsupportedMessageKind)?;
        if !self.accepts_version(&protocol_version) {
            return Err(CodecError::UnsupportedVersion(protocol_version));
        }

        let timestamp = match obj.remove("timestamp") {
            None | Some(Value::Null) => Utc::now(),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map_err(|e| CodecError::malformed(format!("invalid timestamp: {e}"), bytes))?
                .with_timezone(&Utc),
            Some(_) => return Err(CodecError::malformed("timestamp must be a string", bytes)),
        };
        let sender_id = take_optional_str(&mut obj, "senderId", bytes)?.unwrap_or_default();
        let receiver_id = take_optional_str(&mut obj, "receiverId", bytes)?.unwrap_or_default();
        let session_id = take_optional_str(&mut obj, "sessionId", bytes)?.unwrap_or_default();
        let correlation_id = take_optional_str(&mut obj, "correlationId", bytes)?;
        let priority = match obj.remove("priority") {
            None | Some(Value::Null) => Priority::Normal,
            Some(v) => serde_json::from_value(v)
                .map_err(|e| CodecError::malformed(format!("invalid priority: {e}"), bytes))?,
        };
        let mut metadata = match obj.remove("metadata") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(m)) => m,
            Some(_) => return Err(CodecError::malformed("metadata must be an object", bytes)),
        };
        let payload = obj.remove("payload").unwrap_or(Value::Object(Map::new()));
        let body = decode_payload(kind, payload)
            .map_err(|e| CodecError::malformed(format!("invalid {kind} payload: {e}"), bytes))?;

        // 前向兼容：未知字段保留在 metadata 中
        for (key, value) in obj {
            if !ENVELOPE_FIELDS.contains(&key.as_str()) {
                metadata.entry(key).or_insert(value);
            }
        }

        Ok(Message {
            id,
            protocol_version,
            timestamp,
            sender_id,
            receiver_id,
            session_id,
            priority,
            correlation_id,
            metadata,
            body,
        })
    }
}

/// 使用默认版本集编码
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    Codec::default().encode(message)
}

/// 使用默认版本集解码
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    Codec::default().decode(bytes)
}

/// 在双方支持的版本中选择最高者
pub fn negotiate_version(ours: &[String], theirs: &[String]) -> Option<String> {
    ours.iter()
        .filter(|v| theirs.contains(v))
        .filter_map(|v| parse_version(v).map(|parsed| (parsed, v)))
        .max_by_key(|(parsed, _)| *parsed)
        .map(|(_, v)| v.clone())
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map(|m| m.parse().ok()).unwrap_or(Some(0))?;
    Some((major, minor))
}

fn take_required_str(
    obj: &mut Map<String, Value>,
    key: &str,
    raw: &[u8],
) -> Result<String, CodecError> {
    match obj.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s),
        Some(Value::String(_)) => Err(CodecError::malformed(format!("empty {key}"), raw)),
        Some(_) => Err(CodecError::malformed(format!("{key} must be a string"), raw)),
        None => Err(CodecError::malformed(format!("missing {key}"), raw)),
    }
}

fn take_optional_str(
    obj: &mut Map<String, Value>,
    key: &str,
    raw: &[u8],
) -> Result<Option<String>, CodecError> {
    match obj.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(CodecError::malformed(format!("{key} must be a string"), raw)),
    }
}

fn encode_payload(body: &MessageBody) -> Result<Value, serde_json::Error> {
    match body {
        MessageBody::Registration(p) => serde_json::to_value(p),
        MessageBody::RegistrationAck(p) => serde_json::to_value(p),
        MessageBody::CommandRequest(p) => serde_json::to_value(p),
        MessageBody::CommandResponse(p) => serde_json::to_value(p),
        MessageBody::ProgressUpdate(p) => serde_json::to_value(p),
        MessageBody::Heartbeat(p) => serde_json::to_value(p),
        MessageBody::HeartbeatAck(p) => serde_json::to_value(p),
        MessageBody::Disconnect(p) => serde_json::to_value(p),
        MessageBody::Cancel(p) => serde_json::to_value(p),
    }
}

fn decode_payload(kind: MessageKind, payload: Value) -> Result<MessageBody, serde_json::Error> {
    Ok(match kind {
        MessageKind::Registration => MessageBody::Registration(serde_json::from_value(payload)?),
        MessageKind::RegistrationAck => {
            MessageBody::RegistrationAck(serde_json::from_value(payload)?)
        }
        MessageKind::CommandRequest => MessageBody::CommandRequest(serde_json::from_value(payload)?),
        MessageKind::CommandResponse => {
            MessageBody::CommandResponse(serde_json::from_value(payload)?)
        }
        MessageKind::ProgressUpdate => MessageBody::ProgressUpdate(serde_json::from_value(payload)?),
        MessageKind::Heartbeat => MessageBody::Heartbeat(serde_json::from_value(payload)?),
        MessageKind::HeartbeatAck => MessageBody::HeartbeatAck(serde_json::from_value(payload)?),
        MessageKind::Disconnect => MessageBody::Disconnect(serde_json::from_value(payload)?),
        MessageKind::Cancel => MessageBody::Cancel(serde_json::from_value(payload)?),
    })
}
