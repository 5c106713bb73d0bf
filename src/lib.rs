//! Hive - Rust 多智能体编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与校验
//! - **core**: 错误分类与恢复、执行上下文、并发调度、优雅关闭
//! - **directory**: Agent 目录（注册、能力发现、心跳与健康状态）
//! - **director**: 组合根，对外提交任务与订阅事件
//! - **history**: 执行报告与 Agent 变更的异步归档
//! - **monitor**: 执行监控（状态/进度事件、异常检测、执行报告）
//! - **orchestrator**: DAG 遍历、Agent 选择、派发、重试与故障转移
//! - **planner**: 意图解析、计划生成与拓扑优化
//! - **pool**: 按 Agent 分组的连接池
//! - **protocol**: 版本化消息信封与编解码
//! - **resilience**: 重试策略与熔断器
//! - **transport**: stdio / event-stream / chunked-HTTP / 进程内传输

pub mod config;
pub mod core;
pub mod directory;
pub mod director;
pub mod history;
pub mod monitor;
pub mod observability;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod protocol;
pub mod resilience;
pub mod transport;

pub use director::{Director, DirectorBuilder};
