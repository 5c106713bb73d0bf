//! Director：组合根
//!
//! 显式构造并持有目录、熔断器、连接池、规划器、编排器与监控（没有全局单例），
//! 对外只暴露「提交任务」与「订阅状态/进度事件流」两类接口。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::{
    ExecutionContext, HiveError, PoolCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use crate::directory::{AgentDescriptor, AgentDirectory, AgentSnapshot};
use crate::history::{archive_report, HistorySink, TracingHistory};
use crate::monitor::{ExecutionEvent, ExecutionMonitor, ExecutionReport, MonitorConfig};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::planner::{
    HttpInferenceClient, InferenceClient, IntentModel, Planner, StaticInferenceClient, TaskPlan,
};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::protocol::Codec;
use crate::resilience::{BreakerConfig, BreakerRegistry};
use crate::transport::{ConnectOptions, TransportSet};

/// 空闲连接回收周期
const IDLE_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Director 构建器：未显式指定的协作方按配置创建
pub struct DirectorBuilder {
    config: AppConfig,
    transports: Option<TransportSet>,
    inference: Option<Arc<dyn InferenceClient>>,
    history: Option<Arc<dyn HistorySink>>,
}

impl DirectorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            transports: None,
            inference: None,
            history: None,
        }
    }

    /// 替换传输集合（如加入进程内传输）
    pub fn with_transports(mut self, transports: TransportSet) -> Self {
        self.transports = Some(transports);
        self
    }

    pub fn with_inference(mut self, inference: Arc<dyn InferenceClient>) -> Self {
        self.inference = Some(inference);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    /// 校验配置、装配组件并注册静态配置的 Agent
    pub async fn build(self) -> Result<Director, HiveError> {
        let config = self.config;
        config.validate()?;

        let http = reqwest::Client::new();
        let history = self.history.unwrap_or_else(|| Arc::new(TracingHistory));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig::from(&config.breaker)));
        let directory = Arc::new(AgentDirectory::new(
            &config.directory,
            Arc::clone(&breakers),
            Arc::clone(&history),
        ));
        for agent in &config.agents {
            directory.register(agent.clone()).await?;
        }

        let transports = self
            .transports
            .unwrap_or_else(|| TransportSet::with_defaults(http.clone()));
        let options = ConnectOptions {
            connect_timeout: Duration::from_millis(config.pool.connect_timeout_ms),
            channel_capacity: config.pool.channel_capacity.max(1),
            codec: Codec::new(config.protocol.supported_versions.clone()),
        };
        let pool = Arc::new(ConnectionPool::new(
            transports,
            options,
            PoolConfig::from(&config.pool),
            Arc::clone(&directory),
        ));

        let shutdown = Arc::new(ShutdownManager::new());
        let monitor = Arc::new(ExecutionMonitor::new(MonitorConfig::from(&config.monitor)));
        monitor.spawn_progress_pump(shutdown.token());

        let inference_timeout = Duration::from_secs(config.inference.timeout_secs);
        let inference = self.inference.unwrap_or_else(|| match &config.inference.endpoint {
            Some(endpoint) => Arc::new(HttpInferenceClient::new(http, endpoint.clone(), inference_timeout)),
            None => Arc::new(StaticInferenceClient::unavailable()),
        });
        let planner = Planner::new(Arc::clone(&directory), inference, inference_timeout);

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig::from(&config),
            Arc::clone(&directory),
            Arc::clone(&breakers),
            Arc::clone(&pool),
            Arc::clone(&monitor),
        ));

        tracing::info!(
            name = config.app.name.as_deref().unwrap_or("hive"),
            agents = config.agents.len(),
            "director ready"
        );
        Ok(Director {
            config,
            directory,
            pool,
            planner,
            orchestrator,
            monitor,
            history,
            shutdown,
        })
    }
}

/// 组合根
pub struct Director {
    config: AppConfig,
    directory: Arc<AgentDirectory>,
    pool: Arc<ConnectionPool>,
    planner: Planner,
    orchestrator: Arc<Orchestrator>,
    monitor: Arc<ExecutionMonitor>,
    history: Arc<dyn HistorySink>,
    shutdown: Arc<ShutdownManager>,
}

impl Director {
    pub fn builder(config: AppConfig) -> DirectorBuilder {
        DirectorBuilder::new(config)
    }

    /// 自由文本或 JSON 工作流
    pub async fn submit_task(&self, text: &str, context: &ExecutionContext) -> Result<ExecutionReport, HiveError> {
        let plan = self.planner.plan(text, context).await?;
        self.submit_plan(plan, context).await
    }

    /// 已解析的声明式工作流
    pub async fn submit_workflow(
        &self,
        intent: &IntentModel,
        context: &ExecutionContext,
    ) -> Result<ExecutionReport, HiveError> {
        let plan = self.plan_workflow(intent, context).await?;
        self.submit_plan(plan, context).await
    }

    /// 执行计划并生成报告；报告异步归档到历史
    pub async fn submit_plan(&self, plan: TaskPlan, context: &ExecutionContext) -> Result<ExecutionReport, HiveError> {
        // 进程关闭时取消计划
        let watcher = {
            let token = self.shutdown.token();
            let context = context.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                context.cancel();
            })
        };
        let executed = self.orchestrator.execute(plan, context).await;
        watcher.abort();

        let plan = executed?;
        let report = self.monitor.report(&plan);
        self.monitor.forget(&plan.id);
        archive_report(&self.history, report.clone());
        tracing::info!(plan = %report.plan_id, "{}", report.summary);
        Ok(report)
    }

    /// 只规划不执行
    pub async fn plan(&self, text: &str, context: &ExecutionContext) -> Result<TaskPlan, HiveError> {
        Ok(self.planner.plan(text, context).await?)
    }

    pub async fn plan_workflow(&self, intent: &IntentModel, context: &ExecutionContext) -> Result<TaskPlan, HiveError> {
        let plan = self.planner.generate_plan(intent, context).await?;
        Ok(self.planner.optimize_plan(plan)?)
    }

    pub async fn register_agent(&self, descriptor: AgentDescriptor) -> Result<(), HiveError> {
        Ok(self.directory.register(descriptor).await?)
    }

    pub async fn deregister_agent(&self, agent_id: &str) -> Result<AgentDescriptor, HiveError> {
        let descriptor = self.directory.deregister(agent_id).await?;
        self.pool.evict(agent_id).await;
        Ok(descriptor)
    }

    pub async fn agents(&self) -> Vec<AgentSnapshot> {
        self.directory.list().await
    }

    /// 计划/步骤状态、进度与异常事件流
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.monitor.subscribe()
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        &self.monitor
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    /// 后台维护：心跳过期清扫、空闲连接回收、异常扫描，直到关闭
    pub fn start_background(&self) -> JoinHandle<()> {
        let directory = Arc::clone(&self.directory);
        let pool = Arc::clone(&self.pool);
        let monitor = Arc::clone(&self.monitor);
        let token = self.shutdown.token();
        let sweep_every = directory.heartbeat_interval();
        let scan_every = Duration::from_millis(self.config.monitor.scan_interval_ms.max(10));

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            let mut cleanup = tokio::time::interval(IDLE_CLEANUP_INTERVAL);
            let mut scan = tokio::time::interval(scan_every);
            for timer in [&mut sweep, &mut cleanup, &mut scan] {
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            }
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sweep.tick() => {
                        for agent_id in directory.sweep().await {
                            pool.evict(&agent_id).await;
                        }
                    }
                    _ = cleanup.tick() => {
                        pool.cleanup_idle().await;
                    }
                    _ = scan.tick() => {
                        monitor.scan();
                    }
                }
            }
            tracing::debug!("background maintenance stopped");
        })
    }

    /// 取消在途计划、停止后台任务并关闭全部连接
    pub async fn shutdown(&self) {
        self.shutdown.trigger(ShutdownReason::Requested);
        let mut coordinator = ShutdownCoordinator::new(Arc::clone(&self.shutdown));
        coordinator.register(PoolCleanup::new(Arc::clone(&self.pool)));
        let summary = coordinator.run_cleanup().await;
        if !summary.failed.is_empty() {
            tracing::warn!(failed = ?summary.failed, "shutdown finished with errors");
        }
    }
}
