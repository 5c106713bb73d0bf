//! 重试与熔断：包裹每一次 acquire + send + receive

pub mod breaker;
pub mod retry;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState, CircuitBreaker};
pub use retry::{retry, RetryOutcome, RetryPolicy};
