//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__RETRY__MAX_RETRIES=5`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::HiveError;
use crate::directory::AgentDescriptor;
use crate::orchestrator::{OptionalPolicy, SelectionStrategy};
use crate::protocol::PROTOCOL_VERSION;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub protocol: ProtocolSection,
    pub pool: PoolSection,
    pub retry: RetrySection,
    pub breaker: BreakerSection,
    pub directory: DirectorySection,
    pub orchestrator: OrchestratorSection,
    pub monitor: MonitorSection,
    pub inference: InferenceSection,
    /// 静态配置的 Agent
    pub agents: Vec<AgentDescriptor>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [protocol] 段：本端支持的协议版本
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_protocol_version")]
    pub version: String,
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<String>,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_supported_versions() -> Vec<String> {
    vec![PROTOCOL_VERSION.to_string()]
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            version: default_protocol_version(),
            supported_versions: default_supported_versions(),
        }
    }
}

/// [pool] 段：连接池与连接建立
#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_max_idle_per_agent")]
    pub max_idle_per_agent: usize,
    #[serde(default = "default_max_connections_per_agent")]
    pub max_connections_per_agent: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// 每条连接的入站消息缓冲
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_max_idle_per_agent() -> usize {
    2
}

fn default_max_connections_per_agent() -> usize {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_idle_per_agent: default_max_idle_per_agent(),
            max_connections_per_agent: default_max_connections_per_agent(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// [retry] 段：指数退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// [breaker] 段：熔断
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_secs: default_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// [directory] 段：心跳
#[derive(Debug, Clone, Deserialize)]
pub struct DirectorySection {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// 连续错过多少个心跳周期后视为 Offline
    #[serde(default = "default_missed_heartbeat_limit")]
    pub missed_heartbeat_limit: u32,
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_missed_heartbeat_limit() -> u32 {
    3
}

impl Default for DirectorySection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_heartbeat_limit: default_missed_heartbeat_limit(),
        }
    }
}

/// [orchestrator] 段
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_concurrency_per_plan")]
    pub max_concurrency_per_plan: usize,
    #[serde(default = "default_max_concurrency_per_agent")]
    pub max_concurrency_per_agent: usize,
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
    /// 选择策略顺序，为空时用默认顺序
    #[serde(default = "SelectionStrategy::default_order")]
    pub strategies: Vec<SelectionStrategy>,
    #[serde(default)]
    pub optional_policy: OptionalPolicy,
}

fn default_max_concurrency_per_plan() -> usize {
    4
}

fn default_max_concurrency_per_agent() -> usize {
    2
}

fn default_cancel_grace_ms() -> u64 {
    2000
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrency_per_plan: default_max_concurrency_per_plan(),
            max_concurrency_per_agent: default_max_concurrency_per_agent(),
            cancel_grace_ms: default_cancel_grace_ms(),
            strategies: SelectionStrategy::default_order(),
            optional_policy: OptionalPolicy::default(),
        }
    }
}

/// [monitor] 段：异常检测与进度通道
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_anomaly_factor")]
    pub anomaly_factor: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// 样本不足时的固定阈值（秒）
    #[serde(default)]
    pub default_threshold_secs: Option<u64>,
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

fn default_anomaly_factor() -> f64 {
    3.0
}

fn default_min_samples() -> usize {
    5
}

fn default_progress_capacity() -> usize {
    256
}

fn default_scan_interval_ms() -> u64 {
    1000
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            anomaly_factor: default_anomaly_factor(),
            min_samples: default_min_samples(),
            default_threshold_secs: None,
            progress_capacity: default_progress_capacity(),
            scan_interval_ms: default_scan_interval_ms(),
        }
    }
}

/// [inference] 段：外部推理服务；未配置 endpoint 时自由文本任务不可用
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceSection {
    pub endpoint: Option<String>,
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_inference_timeout_secs() -> u64 {
    30
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_inference_timeout_secs(),
        }
    }
}

impl AppConfig {
    /// 所有出站调用都必须有超时；为 0 视为配置错误
    pub fn validate(&self) -> Result<(), HiveError> {
        let timeouts = [
            ("pool.acquire_timeout_ms", self.pool.acquire_timeout_ms),
            ("pool.connect_timeout_ms", self.pool.connect_timeout_ms),
            ("pool.handshake_timeout_ms", self.pool.handshake_timeout_ms),
            ("inference.timeout_secs", self.inference.timeout_secs),
            ("orchestrator.cancel_grace_ms", self.orchestrator.cancel_grace_ms),
            ("directory.heartbeat_interval_secs", self.directory.heartbeat_interval_secs),
        ];
        if let Some((key, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(HiveError::Config(format!(
                "{key} must be greater than zero: missing timeout is a programming error"
            )));
        }
        if self.protocol.supported_versions.is_empty() {
            return Err(HiveError::Config("protocol.supported_versions is empty".into()));
        }
        if !self.protocol.supported_versions.contains(&self.protocol.version) {
            return Err(HiveError::Config(format!(
                "protocol.version {} is not among supported_versions",
                self.protocol.version
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(HiveError::Config("retry.multiplier must be >= 1.0".into()));
        }
        for agent in &self.agents {
            if let Some(cap) = agent.capabilities.iter().find(|c| c.timeout_seconds == 0) {
                return Err(HiveError::Config(format!(
                    "agent {} capability {} has no timeout",
                    agent.agent_id, cap.name
                )));
            }
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
