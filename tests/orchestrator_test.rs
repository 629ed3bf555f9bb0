//! 编排器端到端测试：脚本化预言机 + 假沙箱，覆盖每种终止路径

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use prowl::config::AppConfig;
use prowl::core::{new_session, AgentError, Collaborators, Objective, Orchestrator, RunStatus};
use prowl::memory::ActionRequest;
use prowl::react::{
    parse_oracle_output, DecisionOracle, LoopEvent, OracleReply, OracleRole, TokenCount, TranscriptView,
};
use prowl::tools::{
    ExecutionSandbox, ExpectedValueValidator, PatternExtractor, SandboxOutput, DEFAULT_ARTIFACT_PATTERN,
};

const CURL_ACTION: &str = r#"{"tool": "execute_command", "args": {"command": "curl -s http://target/"}}"#;

/// 按顺序返回预设回复，用完后重复最后一条
struct Scripted {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            last: Mutex::new(String::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DecisionOracle for Scripted {
    async fn invoke(&self, _role: OracleRole, _view: &TranscriptView<'_>) -> Result<OracleReply, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(text) = next {
            *last = text;
        }
        Ok(parse_oracle_output(&last))
    }

    /// 每次调用计 10 + 2 个 token
    fn token_usage(&self) -> Option<TokenCount> {
        let calls = self.calls() as u64;
        Some(TokenCount {
            prompt: calls * 10,
            completion: calls * 2,
            total: calls * 12,
        })
    }
}

/// 每次返回同样的输出
struct FixedSandbox(String);

#[async_trait]
impl ExecutionSandbox for FixedSandbox {
    async fn run(&self, _request: &ActionRequest, _timeout: Duration) -> Result<SandboxOutput, AgentError> {
        Ok(SandboxOutput {
            stdout: self.0.clone(),
            exit_status: Some(0),
        })
    }
}

struct PanickingSandbox;

#[async_trait]
impl ExecutionSandbox for PanickingSandbox {
    async fn run(&self, _request: &ActionRequest, _timeout: Duration) -> Result<SandboxOutput, AgentError> {
        panic!("sandbox exploded");
    }
}

fn verdict_json(status: &str, level: &str) -> String {
    format!(
        r#"{{"audit_result": {{"status": "{status}", "confidence": 0.8, "reasoning": "checked"}},
            "failure_analysis": {{"level": "{level}", "root_cause": "login form is not injectable", "recommendations": ["try another vector"]}}}}"#
    )
}

fn test_config(max_attempts: u32) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.control.max_attempts = max_attempts;
    cfg.llm.request_timeout_secs = 5;
    cfg.sandbox.timeout_secs = 5;
    cfg
}

fn collaborators(
    planner: Arc<Scripted>,
    executor: Arc<Scripted>,
    reflector: Arc<Scripted>,
    sandbox: Arc<dyn ExecutionSandbox>,
    expected: Option<&str>,
) -> Collaborators {
    Collaborators {
        planner_oracle: planner,
        executor_oracle: executor,
        evaluation_oracle: reflector,
        sandbox,
        validator: Arc::new(
            ExpectedValueValidator::new(expected.map(str::to_string), DEFAULT_ARTIFACT_PATTERN).unwrap(),
        ),
        extractor: Arc::new(PatternExtractor::new().unwrap()),
    }
}

#[tokio::test]
async fn test_verified_artifact_in_output_ends_run() {
    let cfg = test_config(10);
    let mut session = new_session(Objective::new("http://target", "find the flag"), &cfg);
    let collab = collaborators(
        Scripted::new(&["Fetch the index page first."]),
        Scripted::new(&[CURL_ACTION]),
        Scripted::new(&[&verdict_json("PARTIAL", "L0")]),
        Arc::new(FixedSandbox("<html>welcome flag{abc123}</html>".into())),
        Some("flag{abc123}"),
    );

    let outcome = Orchestrator::new(&cfg, collab).run(&mut session.state).await;

    assert_eq!(outcome.status, RunStatus::Verified);
    assert_eq!(outcome.result.as_deref(), Some("flag{abc123}"));
    assert_eq!(outcome.attempts, 1);
    assert!(session.state.submitted_artifacts.contains(&"flag{abc123}".to_string()));
}

#[tokio::test]
async fn test_unconfirmed_candidate_is_not_a_result() {
    let cfg = test_config(2);
    let mut session = new_session(Objective::new("http://target", "find the flag"), &cfg);
    let collab = collaborators(
        Scripted::new(&["Look around."]),
        Scripted::new(&[CURL_ACTION]),
        Scripted::new(&[&verdict_json("VERIFIED", "L0")]),
        Arc::new(FixedSandbox("flag{decoy}".into())),
        Some("flag{real}"),
    );

    let outcome = Orchestrator::new(&cfg, collab).run(&mut session.state).await;

    assert_ne!(outcome.status, RunStatus::Verified);
    assert!(outcome.result.is_none());
}

#[tokio::test]
async fn test_text_only_executor_hits_step_ceiling() {
    let cfg = test_config(2);
    let executor = Scripted::new(&["I am still thinking about the login form."]);
    let mut session = new_session(Objective::new("http://target", "find the flag"), &cfg);
    let collab = collaborators(
        Scripted::new(&["Enumerate the site."]),
        executor.clone(),
        Scripted::new(&[&verdict_json("FAILED", "L4")]),
        Arc::new(FixedSandbox("nothing".into())),
        None,
    );

    let orchestrator = Orchestrator::new(&cfg, collab);
    let ceiling = orchestrator.step_ceiling(&session.state);
    let outcome = orchestrator.run(&mut session.state).await;

    assert_eq!(outcome.status, RunStatus::Exhausted);
    assert!(outcome.reason.contains("step ceiling"), "{}", outcome.reason);
    assert_eq!(outcome.steps, ceiling);
    assert_eq!(outcome.attempts, 0);
    assert!(executor.calls() >= (ceiling - 1) as usize);
}

#[tokio::test]
async fn test_attempt_budget_exhaustion() {
    let cfg = test_config(2);
    let planner = Scripted::new(&["Try the search parameter."]);
    let executor = Scripted::new(&[CURL_ACTION]);
    let mut session = new_session(Objective::new("http://target", "find the flag"), &cfg);
    let collab = collaborators(
        planner.clone(),
        executor.clone(),
        Scripted::new(&[&verdict_json("FAILED", "L4")]),
        Arc::new(FixedSandbox("<html>no results</html>".into())),
        None,
    );

    let outcome = Orchestrator::new(&cfg, collab).run(&mut session.state).await;

    assert_eq!(outcome.status, RunStatus::Exhausted);
    assert!(outcome.reason.contains("max attempts"), "{}", outcome.reason);
    assert_eq!(outcome.attempts, 2);
    assert!(outcome.result.is_none());
    assert_eq!(session.state.failure_history.len(), 2);

    assert_eq!(planner.calls(), 2);
    assert_eq!(outcome.token_usage[&OracleRole::Planner].total, 24);
    assert_eq!(outcome.token_usage[&OracleRole::Executor].prompt, executor.calls() as u64 * 10);
    assert_eq!(outcome.token_usage.len(), 3);
    assert_eq!(
        outcome.total_tokens().total,
        outcome.token_usage.values().map(|t| t.total).sum::<u64>()
    );
}

#[tokio::test]
async fn test_repeated_strategic_failure_terminates() {
    let cfg = test_config(20);
    let mut session = new_session(Objective::new("http://target", "find the flag"), &cfg);
    let collab = collaborators(
        Scripted::new(&["Try something else."]),
        Scripted::new(&[CURL_ACTION]),
        Scripted::new(&[&verdict_json("FAILED", "L5")]),
        Arc::new(FixedSandbox("<html>static page</html>".into())),
        None,
    );

    let outcome = Orchestrator::new(&cfg, collab).run(&mut session.state).await;

    assert_eq!(outcome.status, RunStatus::StrategicFailure);
    assert_eq!(outcome.status.exit_code(), 0);
    assert_eq!(outcome.attempts, cfg.reflector.strategic_streak as u32);
    // 前两次 L5 被升级门降为 L4
    let levels: Vec<String> = session
        .state
        .failure_history
        .iter()
        .filter_map(|v| v.level.map(|l| l.to_string()))
        .collect();
    assert_eq!(levels, vec!["L4", "L4", "L5"]);
}

#[tokio::test]
async fn test_pre_cancelled_run_stops_immediately() {
    let cfg = test_config(5);
    let planner = Scripted::new(&["plan"]);
    let mut session = new_session(Objective::new("http://target", "find the flag"), &cfg);
    let collab = collaborators(
        planner.clone(),
        Scripted::new(&[CURL_ACTION]),
        Scripted::new(&[&verdict_json("FAILED", "L4")]),
        Arc::new(FixedSandbox("nothing".into())),
        None,
    );
    let token = CancellationToken::new();
    token.cancel();

    let outcome = Orchestrator::new(&cfg, collab)
        .with_cancel_token(token)
        .run(&mut session.state)
        .await;

    assert_eq!(outcome.status, RunStatus::Exhausted);
    assert_eq!(outcome.reason, "cancelled");
    assert_eq!(outcome.steps, 0);
    assert_eq!(planner.calls(), 0);
}

#[tokio::test]
async fn test_panicking_node_becomes_error_status() {
    let cfg = test_config(5);
    let mut session = new_session(Objective::new("http://target", "find the flag"), &cfg);
    let collab = collaborators(
        Scripted::new(&["plan"]),
        Scripted::new(&[CURL_ACTION]),
        Scripted::new(&[&verdict_json("FAILED", "L4")]),
        Arc::new(PanickingSandbox),
        None,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = Orchestrator::new(&cfg, collab)
        .with_events(tx)
        .run(&mut session.state)
        .await;

    assert_eq!(outcome.status, RunStatus::Error);
    assert_eq!(outcome.status.exit_code(), 1);
    assert!(outcome.reason.contains("sandbox exploded"), "{}", outcome.reason);

    let mut saw_dispatch = false;
    let mut terminated = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            LoopEvent::ActionDispatched { tool, .. } => saw_dispatch |= tool == "execute_command",
            LoopEvent::Terminated { status, .. } => terminated = Some(status),
            _ => {}
        }
    }
    assert!(saw_dispatch);
    assert_eq!(terminated.as_deref(), Some("error"));
}
