//! 核心层：错误分类与恢复、执行上下文、并发调度、优雅关闭

pub mod context;
pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod task_scheduler;

pub use context::ExecutionContext;
pub use error::{ErrorClass, HiveError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    CleanupSummary, PoolCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
pub use task_scheduler::{DispatchId, PlanLimiter, TaskScheduler};
