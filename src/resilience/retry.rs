//! 有界重试
//!
//! 第 n 次重试前等待 `base * multiplier^(n-1)`（不超过 max_delay）。是否重试只看
//! [`RecoveryEngine`] 的判定，非白名单错误立即返回。

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetrySection;
use crate::core::{HiveError, RecoveryEngine};

/// 重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            multiplier: section.multiplier,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// 第 `retry` 次重试（从 1 开始）前的等待时间
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// 重试结果与实际尝试次数
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, HiveError>,
    pub attempts: u32,
}

/// 执行 `op`，失败时按策略重试；`op` 收到的是本次尝试序号（从 1 开始）
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    retry_application_errors: bool,
    mut op: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, HiveError>>,
{
    let engine = RecoveryEngine::new();
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(HiveError::Cancelled),
                attempts: attempt,
            };
        }
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => err,
        };

        if attempt >= max_attempts || !engine.is_retryable(&err, retry_application_errors) {
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = policy.delay_for(attempt);
        tracing::warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, retrying: {}",
            err
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return RetryOutcome {
                    result: Err(HiveError::Cancelled),
                    attempts: attempt,
                };
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
