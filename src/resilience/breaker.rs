//! 每 Agent 一个熔断器
//!
//! Closed --(窗口内连续 N 次失败)--> Open --(冷却结束)--> HalfOpen（仅放行一个探测请求）
//! --> 成功回到 Closed / 失败回到 Open。只有连接类失败与超时计入；Agent 报告的业务失败
//! 说明对端可达，按成功处理。

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerSection;
use crate::core::{ErrorClass, HiveError};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&BreakerSection> for BreakerConfig {
    fn from(section: &BreakerSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold,
            window: Duration::from_secs(section.window_secs),
            cooldown: Duration::from_secs(section.cooldown_secs),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// 调用结果对熔断器的影响
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Success,
    Failure,
    Neutral,
}

fn verdict(err: &HiveError) -> Verdict {
    match err {
        HiveError::Cancelled | HiveError::PoolExhausted(_) | HiveError::CircuitOpen(_) => Verdict::Neutral,
        e if matches!(e.class(), ErrorClass::Transport | ErrorClass::Timeout) => Verdict::Failure,
        // 协议错误同样说明对端不可用
        e if e.class() == ErrorClass::Protocol => Verdict::Failure,
        _ => Verdict::Success,
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    agent_id: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(agent_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window_start: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 当前状态；冷却已过的 Open 视为 HalfOpen
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open if self.cooldown_elapsed(&inner) => BreakerState::HalfOpen,
            state => state,
        }
    }

    fn cooldown_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .map(|at| at.elapsed() >= self.config.cooldown)
            .unwrap_or(true)
    }

    /// 是否允许发起一次调用；HalfOpen 下只放行一个探测
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.cooldown_elapsed(&inner) {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!(agent = %self.agent_id, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(agent = %self.agent_id, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.window_start = None;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();
        match inner.state {
            BreakerState::HalfOpen | BreakerState::Open => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
                tracing::warn!(agent = %self.agent_id, "probe failed, circuit re-opened");
            }
            BreakerState::Closed => {
                let in_window = inner
                    .window_start
                    .map(|start| now.duration_since(start) <= self.config.window)
                    .unwrap_or(false);
                if !in_window {
                    inner.window_start = Some(now);
                    inner.consecutive_failures = 0;
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    tracing::warn!(
                        agent = %self.agent_id,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
            }
        }
    }

    /// 探测请求未给出结论（如被取消），释放探测名额
    fn release_probe(&self) {
        self.lock().probe_in_flight = false;
    }

    /// 在熔断保护下执行一次调用；Open 时直接返回 `CircuitOpen`，不触发任何网络操作
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, HiveError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HiveError>>,
    {
        if !self.try_acquire() {
            return Err(HiveError::CircuitOpen(self.agent_id.clone()));
        }
        let result = op().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) => match verdict(err) {
                Verdict::Success => self.record_success(),
                Verdict::Failure => self.record_failure(),
                Verdict::Neutral => self.release_probe(),
            },
        }
        result
    }
}

/// 按 Agent 索引的熔断器集合；状态同时供目录计算健康度
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, agent_id: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            breakers
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(agent_id, self.config.clone()))),
        )
    }

    pub fn state(&self, agent_id: &str) -> BreakerState {
        let breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers
            .get(agent_id)
            .map(|b| b.state())
            .unwrap_or(BreakerState::Closed)
    }

    pub fn remove(&self, agent_id: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        breakers.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }

    fn connect_error() -> HiveError {
        HiveError::Transport(TransportError::Connect {
            agent_id: "a".into(),
            reason: "refused".into(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_fails_fast() {
        let breaker = CircuitBreaker::new("a", config());
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _: Result<(), _> = breaker
                .call(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(connect_error())
                })
                .await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let result: Result<(), _> = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result, Err(HiveError::CircuitOpen("a".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_probe() {
        let breaker = CircuitBreaker::new("a", config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // 只放行一个探测
        assert!(breaker.try_acquire());
        assert!(!breaker.try_acquire());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        let result = breaker.call(|| async { Ok::<_, HiveError>(1) }).await;
        assert_eq!(result, Ok(1));
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_window_resets_count() {
        let breaker = CircuitBreaker::new("a", config());
        breaker.record_failure();
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_application_error_counts_as_reachable() {
        let breaker = CircuitBreaker::new("a", config());
        breaker.record_failure();
        breaker.record_failure();
        let _: Result<(), _> = breaker
            .call(|| async {
                Err(HiveError::Application {
                    agent_id: "a".into(),
                    code: "E".into(),
                    message: "x".into(),
                })
            })
            .await;
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_registry_default_closed() {
        let registry = BreakerRegistry::new(config());
        assert_eq!(registry.state("unknown"), BreakerState::Closed);
        registry.get("a").record_failure();
        assert!(Arc::ptr_eq(&registry.get("a"), &registry.get("a")));
    }
}
