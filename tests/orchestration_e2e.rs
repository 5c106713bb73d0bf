//! 端到端编排测试：Director + 进程内 Agent

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use hive::config::AppConfig;
use hive::core::{ErrorClass, ExecutionContext, HiveError};
use hive::directory::AgentDescriptor;
use hive::history::InMemoryHistory;
use hive::monitor::ExecutionEvent;
use hive::orchestrator::{OptionalPolicy, CONTEXT_PARAMETER};
use hive::planner::{PlanError, PlanStatus, StepStatus, TaskPlan, TaskStep};
use hive::protocol::{
    AgentType, Capability, CommandResponsePayload, ErrorPayload, ExecutionStatus, Message,
    MessageBody, ProgressUpdatePayload, ERROR_CODE_BUSY, ERROR_CODE_REJECTED,
};
use hive::transport::{LocalAgent, MemoryTransport, TransportConfig, TransportSet};
use hive::Director;

#[derive(Debug, Clone)]
enum Reply {
    Complete(Value),
    After(Duration, Value),
    WithProgress(Value),
    Busy,
    Reject,
    Fail,
    Hang,
    /// 回显收到的会话上下文
    EchoContext,
    /// 不回复，直接断开
    Leave,
}

type Log = Arc<Mutex<Vec<String>>>;

/// 按脚本逐次回复的 Agent；脚本耗尽后使用 fallback
struct ScriptedAgent {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    log: Log,
}

impl ScriptedAgent {
    fn new(fallback: Reply, log: &Log) -> Arc<Self> {
        Self::scripted(Vec::new(), fallback, log)
    }

    fn scripted(script: Vec<Reply>, fallback: Reply, log: &Log) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            log: Arc::clone(log),
        })
    }

    fn next(&self) -> Reply {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

fn response(request: &Message, status: ExecutionStatus, result: Option<Value>, error: Option<(&str, &str)>) -> Message {
    request.reply(MessageBody::CommandResponse(CommandResponsePayload {
        execution_id: format!("exec-{}", request.id),
        status,
        result,
        error: error.map(|(code, message)| ErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
        }),
    }))
}

#[async_trait]
impl LocalAgent for ScriptedAgent {
    async fn on_message(&self, message: Message, outbox: &mpsc::Sender<Message>) {
        match &message.body {
            MessageBody::CommandRequest(request) => {
                let step = request
                    .parameters
                    .get("step")
                    .and_then(Value::as_str)
                    .unwrap_or(&request.capability_name)
                    .to_string();
                self.record(format!("start:{step}"));
                let reply = match self.next() {
                    Reply::Complete(value) => response(&message, ExecutionStatus::Completed, Some(value), None),
                    Reply::After(delay, value) => {
                        tokio::time::sleep(delay).await;
                        response(&message, ExecutionStatus::Completed, Some(value), None)
                    }
                    Reply::WithProgress(value) => {
                        let progress = message.reply(MessageBody::ProgressUpdate(ProgressUpdatePayload {
                            execution_id: format!("exec-{}", message.id),
                            percentage: 50,
                            current_step: "halfway".into(),
                            intermediate_results: None,
                        }));
                        let _ = outbox.send(progress).await;
                        response(&message, ExecutionStatus::Completed, Some(value), None)
                    }
                    Reply::Busy => response(&message, ExecutionStatus::Failed, None, Some((ERROR_CODE_BUSY, "busy"))),
                    Reply::Reject => response(
                        &message,
                        ExecutionStatus::Failed,
                        None,
                        Some((ERROR_CODE_REJECTED, "bad parameters")),
                    ),
                    Reply::Fail => response(&message, ExecutionStatus::Failed, None, Some(("BOOM", "exploded"))),
                    Reply::Hang => return,
                    Reply::EchoContext => {
                        let context = request.parameters.get(CONTEXT_PARAMETER).cloned();
                        response(&message, ExecutionStatus::Completed, context, None)
                    }
                    Reply::Leave => {
                        self.record(format!("leave:{step}"));
                        let bye = Message::disconnect(&message.receiver_id, &message.sender_id, "shutting down");
                        let _ = outbox.send(bye).await;
                        return;
                    }
                };
                self.record(format!("done:{step}"));
                let _ = outbox.send(reply).await;
            }
            MessageBody::Cancel(_) => {
                self.record("cancel".to_string());
                let Some(request_id) = message.correlation_id.clone() else { return };
                let ack = Message::new(
                    message.receiver_id.clone(),
                    message.sender_id.clone(),
                    message.session_id.clone(),
                    MessageBody::CommandResponse(CommandResponsePayload {
                        execution_id: "cancelled".into(),
                        status: ExecutionStatus::Cancelled,
                        result: None,
                        error: None,
                    }),
                )
                .correlated_to(request_id);
                let _ = outbox.send(ack).await;
            }
            _ => {}
        }
    }
}

fn descriptor(agent_id: &str, capability: &str) -> AgentDescriptor {
    AgentDescriptor::new(agent_id, AgentType::Service, TransportConfig::in_process())
        .with_capability(Capability::new(capability, 30))
}

fn step(id: &str, capability: &str) -> TaskStep {
    TaskStep::new(id, capability, 30).with_parameter("step", json!(id))
}

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config
}

struct Harness {
    director: Arc<Director>,
    memory: MemoryTransport,
    history: Arc<InMemoryHistory>,
}

async fn harness(config: AppConfig, agents: Vec<(AgentDescriptor, Option<Arc<dyn LocalAgent>>)>) -> Harness {
    let memory = MemoryTransport::new();
    let mut transports = TransportSet::new();
    transports.register(Arc::new(memory.clone()));
    let history = Arc::new(InMemoryHistory::new());
    let director = Director::builder(config)
        .with_transports(transports)
        .with_history(history.clone())
        .build()
        .await
        .unwrap();
    for (descriptor, agent) in agents {
        // 未挂载实现的 Agent 在目录中可见但不可达
        if let Some(agent) = agent {
            memory.register(descriptor.agent_id.clone(), agent);
        }
        director.register_agent(descriptor).await.unwrap();
    }
    Harness {
        director: Arc::new(director),
        memory,
        history,
    }
}

fn position(log: &Log, entry: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("missing log entry {entry}"))
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn step_event_index(events: &[ExecutionEvent], step_id: &str, status: StepStatus) -> usize {
    events
        .iter()
        .position(|e| {
            matches!(e, ExecutionEvent::StepStatusChanged { step_id: s, status: st, .. } if s == step_id && *st == status)
        })
        .unwrap_or_else(|| panic!("no {status:?} event for {step_id}"))
}

#[tokio::test(start_paused = true)]
async fn test_single_step_completes() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![(
            descriptor("mailer", "SendEmail"),
            Some(ScriptedAgent::new(Reply::Complete(json!({"sent": true})), &log)),
        )],
    )
    .await;

    let plan = TaskPlan::new(
        "send email",
        vec![TaskStep::new("send", "SendEmail", 30).with_parameter("to", json!("a@b.c"))],
    );
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.steps.len(), 1);
    let outcome = &report.steps[0];
    assert_eq!(outcome.status, StepStatus::Completed);
    assert_eq!(outcome.agent_id.as_deref(), Some("mailer"));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.result, Some(json!({"sent": true})));
    assert_eq!(log.lock().unwrap().len(), 2);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.history.reports().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dependency_completes_before_dependent_dispatch() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![(
            descriptor("worker", "Process"),
            Some(ScriptedAgent::new(Reply::After(Duration::from_millis(50), json!("ok")), &log)),
        )],
    )
    .await;
    let mut events = h.director.subscribe();

    let plan = TaskPlan::new("chain", vec![step("a", "Process"), step("b", "Process").depends_on("a")]);
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert!(position(&log, "done:a") < position(&log, "start:b"));

    let events = drain(&mut events);
    assert!(
        step_event_index(&events, "a", StepStatus::Completed)
            < step_event_index(&events, "b", StepStatus::Dispatching)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_agent_exhausts_retries() {
    let h = harness(fast_config(), vec![(descriptor("ghost", "SendEmail"), None)]).await;

    let plan = TaskPlan::new("send", vec![step("send", "SendEmail")]);
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();

    let expected_attempts = fast_config().retry.max_retries + 1;
    assert_eq!(report.status, PlanStatus::Failed);
    let outcome = &report.steps[0];
    assert_eq!(outcome.status, StepStatus::Failed);
    assert_eq!(outcome.attempts, expected_attempts);
    assert_eq!(outcome.error.as_ref().unwrap().class, ErrorClass::Transport);
    assert_eq!(h.memory.connect_count("ghost"), expected_attempts as usize);

    let failure = report.failure.unwrap();
    assert_eq!(failure.step_id, "send");
    assert_eq!(failure.cause.class, ErrorClass::Transport);
}

#[tokio::test(start_paused = true)]
async fn test_unplannable_intent_dispatches_nothing() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![(
            descriptor("mailer", "SendEmail"),
            Some(ScriptedAgent::new(Reply::Complete(json!(null)), &log)),
        )],
    )
    .await;

    let workflow = r#"{"goal": "translate", "steps": [{"capability": "TranslateDocument"}]}"#;
    let err = h
        .director
        .submit_task(workflow, &ExecutionContext::for_user("u1"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HiveError::Plan(PlanError::UnplannableIntent { ref capability }) if capability == "TranslateDocument"
    ));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(h.memory.connect_count("mailer"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_workflow_text_is_planned_and_executed() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![
            (
                descriptor("fetcher", "Fetch"),
                Some(ScriptedAgent::new(Reply::Complete(json!("page")), &log)),
            ),
            (
                descriptor("summarizer", "Summarize"),
                Some(ScriptedAgent::new(Reply::Complete(json!("short")), &log)),
            ),
        ],
    )
    .await;

    let workflow = r#"{
        "goal": "summarize a page",
        "steps": [
            {"id": "summary", "capability": "Summarize", "dependsOn": ["fetch"], "parameters": {"step": "summary"}},
            {"id": "fetch", "capability": "Fetch", "parameters": {"step": "fetch"}}
        ]
    }"#;
    let report = h
        .director
        .submit_task(workflow, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    let order: Vec<&str> = report.steps.iter().map(|s| s.step_id.as_str()).collect();
    assert_eq!(order, vec!["fetch", "summary"]);
    assert!(position(&log, "done:fetch") < position(&log, "start:summary"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_settles_running_and_pending_steps() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![(descriptor("slow", "Process"), Some(ScriptedAgent::new(Reply::Hang, &log)))],
    )
    .await;

    let context = ExecutionContext::for_user("u1");
    let plan = TaskPlan::new("cancel me", vec![step("a", "Process"), step("b", "Process").depends_on("a")]);
    let task = {
        let director = Arc::clone(&h.director);
        let context = context.clone();
        tokio::spawn(async move { director.submit_plan(plan, &context).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    context.cancel();
    let report = task.await.unwrap().unwrap();

    assert_eq!(report.status, PlanStatus::Cancelled);
    assert!(report.failure.is_none());
    for outcome in &report.steps {
        assert_eq!(outcome.status, StepStatus::Cancelled, "step {}", outcome.step_id);
    }
    assert!(log.lock().unwrap().iter().any(|e| e == "cancel"));
    assert!(!log.lock().unwrap().iter().any(|e| e == "start:b"));
}

#[tokio::test(start_paused = true)]
async fn test_required_failure_cancels_pending_steps() {
    let log = Log::default();
    let mut config = fast_config();
    config.orchestrator.max_concurrency_per_plan = 1;
    let h = harness(
        config,
        vec![
            (descriptor("strict", "Validate"), Some(ScriptedAgent::new(Reply::Reject, &log))),
            (
                descriptor("worker", "Process"),
                Some(ScriptedAgent::new(Reply::Complete(json!("ok")), &log)),
            ),
        ],
    )
    .await;

    let plan = TaskPlan::new(
        "validate then process",
        vec![
            step("check", "Validate"),
            step("other", "Process"),
            step("after", "Process").depends_on("check"),
        ],
    );
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    let status = |id: &str| report.steps.iter().find(|s| s.step_id == id).unwrap().status;
    assert_eq!(status("check"), StepStatus::Failed);
    assert_eq!(status("other"), StepStatus::Cancelled);
    assert_eq!(status("after"), StepStatus::Cancelled);

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.step_id, "check");
    assert_eq!(failure.cause.class, ErrorClass::Capability);
    // 参数被拒绝不重试
    assert_eq!(report.steps[0].attempts, 1);
}

async fn run_optional_failure(policy: OptionalPolicy) -> hive::monitor::ExecutionReport {
    let log = Log::default();
    let mut config = fast_config();
    config.orchestrator.optional_policy = policy;
    let h = harness(
        config,
        vec![
            (descriptor("flaky", "Enrich"), Some(ScriptedAgent::new(Reply::Fail, &log))),
            (
                descriptor("worker", "Process"),
                Some(ScriptedAgent::new(Reply::Complete(json!("ok")), &log)),
            ),
        ],
    )
    .await;

    let plan = TaskPlan::new(
        "optional enrich",
        vec![
            step("enrich", "Enrich").optional(),
            step("use-enriched", "Process").depends_on("enrich"),
            step("main", "Process"),
        ],
    );
    h.director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_optional_failure_suppresses_plan_failure() {
    let report = run_optional_failure(OptionalPolicy::SuppressPlanFailure).await;

    let status = |id: &str| report.steps.iter().find(|s| s.step_id == id).unwrap().status;
    assert_eq!(status("enrich"), StepStatus::Failed);
    assert_eq!(status("use-enriched"), StepStatus::Skipped);
    assert_eq!(status("main"), StepStatus::Completed);
    assert_eq!(report.status, PlanStatus::Completed);
    assert!(report.failure.is_none());
    assert_eq!(report.metrics.steps_skipped, 1);
}

#[tokio::test(start_paused = true)]
async fn test_optional_failure_still_fails_plan_when_configured() {
    let report = run_optional_failure(OptionalPolicy::SuppressCancellationOnly).await;

    let status = |id: &str| report.steps.iter().find(|s| s.step_id == id).unwrap().status;
    assert_eq!(status("main"), StepStatus::Completed);
    assert_eq!(status("use-enriched"), StepStatus::Skipped);
    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.failure.as_ref().unwrap().step_id, "enrich");
}

#[tokio::test(start_paused = true)]
async fn test_busy_agent_is_retried() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![(
            descriptor("busy", "Process"),
            Some(ScriptedAgent::scripted(
                vec![Reply::Busy, Reply::Busy],
                Reply::Complete(json!("finally")),
                &log,
            )),
        )],
    )
    .await;

    let plan = TaskPlan::new("busy", vec![step("a", "Process")]);
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.steps[0].attempts, 3);
    assert_eq!(report.metrics.retries_total, 2);
    assert_eq!(report.steps[0].result, Some(json!("finally")));
}

#[tokio::test(start_paused = true)]
async fn test_failover_to_second_agent() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![
            (descriptor("primary", "Resize"), None),
            (
                descriptor("backup", "Resize"),
                Some(ScriptedAgent::new(Reply::Complete(json!("resized")), &log)),
            ),
        ],
    )
    .await;

    let plan = TaskPlan::new("resize", vec![step("a", "Resize")]);
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Completed);
    assert_eq!(report.steps[0].agent_id.as_deref(), Some("backup"));
    assert_eq!(report.steps[0].attempts, 2);
    assert_eq!(h.memory.connect_count("primary"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout() {
    let log = Log::default();
    let mut config = fast_config();
    config.retry.max_retries = 0;
    let h = harness(
        config,
        vec![(descriptor("slow", "Process"), Some(ScriptedAgent::new(Reply::Hang, &log)))],
    )
    .await;

    let mut events = h.director.subscribe();

    let plan = TaskPlan::new("slow", vec![TaskStep::new("a", "Process", 1)]);
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].error.as_ref().unwrap().class, ErrorClass::Timeout);
    assert_eq!(report.metrics.steps_failed, 1);
    assert!(log.lock().unwrap().iter().any(|e| e == "cancel"));

    let events = drain(&mut events);
    assert!(
        step_event_index(&events, "a", StepStatus::Timeout)
            < step_event_index(&events, "a", StepStatus::Failed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_huge_step_timeout_is_capped() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![(
            descriptor("worker", "Process"),
            Some(ScriptedAgent::new(Reply::Complete(json!("ok")), &log)),
        )],
    )
    .await;

    let plan = TaskPlan::new("patient", vec![TaskStep::new("a", "Process", u64::MAX)]);
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_steps_see_scratch_and_earlier_results() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![(
            descriptor("echo", "Process"),
            Some(ScriptedAgent::new(Reply::EchoContext, &log)),
        )],
    )
    .await;

    let context = ExecutionContext::new("s-1", "u1");
    context.set("region", json!("eu")).await;
    let plan = TaskPlan::new("chain", vec![step("a", "Process"), step("b", "Process").depends_on("a")]);
    let report = h.director.submit_plan(plan, &context).await.unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let result = |id: &str| {
        report
            .steps
            .iter()
            .find(|s| s.step_id == id)
            .and_then(|s| s.result.clone())
            .unwrap()
    };
    let a = result("a");
    assert_eq!(a["sessionId"], json!("s-1"));
    assert_eq!(a["userId"], json!("u1"));
    assert_eq!(a["scratch"]["region"], json!("eu"));

    let b = result("b");
    assert_eq!(b["scratch"]["region"], json!("eu"));
    assert_eq!(b["scratch"]["a"], a);
    assert_eq!(context.get("b").await, Some(b));
}

#[tokio::test(start_paused = true)]
async fn test_agent_disconnect_mid_request_deregisters_agent() {
    let log = Log::default();
    let mut config = fast_config();
    config.retry.max_retries = 0;
    let h = harness(
        config,
        vec![(descriptor("leaver", "Process"), Some(ScriptedAgent::new(Reply::Leave, &log)))],
    )
    .await;

    let plan = TaskPlan::new("leave", vec![step("a", "Process")]);
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();

    assert_eq!(report.status, PlanStatus::Failed);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].error.as_ref().unwrap().class, ErrorClass::Transport);
    assert!(log.lock().unwrap().iter().any(|e| e == "leave:a"));
    assert!(h.director.directory().get("leaver").await.is_none());
    assert_eq!(h.director.pool().idle_count("leaver"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_published() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![(
            descriptor("reporter", "Process"),
            Some(ScriptedAgent::new(Reply::WithProgress(json!("done")), &log)),
        )],
    )
    .await;
    let mut events = h.director.subscribe();

    let plan = TaskPlan::new("progress", vec![step("a", "Process")]);
    let report = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap();
    assert_eq!(report.status, PlanStatus::Completed);

    let percentage = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(ExecutionEvent::Progress { step_id, percentage, .. }) if step_id == "a" => return percentage,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(percentage, 50);
}

#[tokio::test(start_paused = true)]
async fn test_cyclic_plan_is_rejected_without_dispatch() {
    let log = Log::default();
    let h = harness(
        fast_config(),
        vec![(
            descriptor("worker", "Process"),
            Some(ScriptedAgent::new(Reply::Complete(json!("ok")), &log)),
        )],
    )
    .await;

    let plan = TaskPlan::new(
        "cycle",
        vec![
            step("a", "Process").depends_on("b"),
            step("b", "Process").depends_on("a"),
        ],
    );
    let err = h
        .director
        .submit_plan(plan, &ExecutionContext::for_user("u1"))
        .await
        .unwrap_err();
    assert!(matches!(err, HiveError::Plan(PlanError::CyclicDependency(_))));
    assert!(log.lock().unwrap().is_empty());
}
