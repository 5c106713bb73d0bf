//! 可观测性：tracing 订阅器初始化
//!
//! 默认过滤 `hive=info`，可用 `RUST_LOG` 覆盖（如 `RUST_LOG=hive=debug` 查看逐条消息）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "hive=info";

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    // 重复初始化（如多个测试）时忽略错误
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
