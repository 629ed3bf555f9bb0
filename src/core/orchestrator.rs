//! 编排器：节点状态机主控循环
//!
//! PLANNER → EXECUTOR →(路由)→ TOOL_RUNNER → REFLECTOR →(结果感知路由)→ …… → END。
//! 同一时刻只运行一个节点，节点返回的 StateUpdate 合并后才开始下一个节点。
//! 全局步数上限（max_attempts × 系数）保证必然终止；节点的错误或 panic 转为终态 error。

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::router::{RouteDecision, RouteReason, Router, RoutingPolicy};
use crate::core::state::{NodeId, RunStatus, SessionState, StateUpdate};
use crate::core::AgentError;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::compressor::ContextCompressor;
use crate::memory::transcript::TranscriptEntry;
use crate::react::events::LoopEvent;
use crate::react::executor::Executor;
use crate::react::oracle::{DecisionOracle, LlmOracle, OracleRole, TokenCount};
use crate::react::planner::Planner;
use crate::react::prompts::PromptSet;
use crate::react::reflector::Reflector;
use crate::react::tool_runner::ToolRunner;
use crate::signals::confidence::ConfidenceAssessor;
use crate::tools::executor::ToolExecutor;
use crate::tools::extractor::{FactExtractor, PatternExtractor};
use crate::tools::sandbox::{ExecutionSandbox, ShellSandbox};
use crate::tools::validator::{ExpectedValueValidator, ResultValidator};

/// 事件中结果预览的长度
const PREVIEW_CHARS: usize = 300;

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig, model_override: Option<&str>) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();
    let model = model_override.unwrap_or(&cfg.llm.model);

    match (deepseek_key, openai_key) {
        (_, Some(key)) if provider != "deepseek" => {
            tracing::info!("Using OpenAI-compatible LLM ({})", model);
            Arc::new(OpenAiClient::new(cfg.llm.base_url.as_deref(), model, &key))
        }
        (Some(key), _) | (None, Some(key)) => {
            tracing::info!("Using DeepSeek LLM ({})", model);
            Arc::new(OpenAiClient::deepseek(Some(model), &key))
        }
        (None, None) => {
            tracing::warn!("No DEEPSEEK_API_KEY or OPENAI_API_KEY set, using mock LLM");
            Arc::new(MockLlmClient::new())
        }
    }
}

/// 编排器依赖的外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub planner_oracle: Arc<dyn DecisionOracle>,
    pub executor_oracle: Arc<dyn DecisionOracle>,
    pub evaluation_oracle: Arc<dyn DecisionOracle>,
    pub sandbox: Arc<dyn ExecutionSandbox>,
    pub validator: Arc<dyn ResultValidator>,
    pub extractor: Arc<dyn FactExtractor>,
}

impl Collaborators {
    /// 按配置组装：每个角色一个独立客户端（可用不同模型，token 用量分角色统计），
    /// 沙箱与验证器来自对应配置段
    pub fn from_config(cfg: &AppConfig) -> Result<Self, AgentError> {
        let prompts = PromptSet::load(cfg.app.prompts_dir.as_deref());
        let planner_llm = create_llm_from_config(cfg, cfg.llm.planner_model.as_deref());
        let executor_llm = create_llm_from_config(cfg, None);
        let reflector_llm = create_llm_from_config(cfg, cfg.llm.reflector_model.as_deref());
        Ok(Self {
            planner_oracle: Arc::new(LlmOracle::new(planner_llm, prompts.clone())),
            executor_oracle: Arc::new(LlmOracle::new(executor_llm, prompts.clone())),
            evaluation_oracle: Arc::new(LlmOracle::new(reflector_llm, prompts)),
            sandbox: Arc::new(ShellSandbox::from_config(&cfg.sandbox)),
            validator: Arc::new(ExpectedValueValidator::from_config(&cfg.validator)?),
            extractor: Arc::new(PatternExtractor::new()?),
        })
    }
}

/// 一次运行的最终结果
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub reason: String,
    pub result: Option<String>,
    pub steps: u32,
    pub attempts: u32,
    /// 各角色预言机的累计 token 用量（只含能报告用量的预言机）
    pub token_usage: BTreeMap<OracleRole, TokenCount>,
}

impl RunOutcome {
    pub fn total_tokens(&self) -> TokenCount {
        self.token_usage
            .values()
            .fold(TokenCount::default(), |acc, t| acc.add(*t))
    }
}

pub struct Orchestrator {
    planner: Planner,
    executor: Executor,
    tool_runner: ToolRunner,
    reflector: Reflector,
    router: Router,
    compressor: ContextCompressor,
    compression_enabled: bool,
    keep_recent: usize,
    extractor: Arc<dyn FactExtractor>,
    usage_sources: Vec<(OracleRole, Arc<dyn DecisionOracle>)>,
    step_ceiling_factor: u32,
    cancel: CancellationToken,
    events: Option<UnboundedSender<LoopEvent>>,
}

impl Orchestrator {
    pub fn new(cfg: &AppConfig, collab: Collaborators) -> Self {
        let oracle_timeout = Duration::from_secs(cfg.llm.request_timeout_secs);
        let assessor = ConfidenceAssessor::new(cfg.control.escalation_failures);

        let mut tool_runner = ToolRunner::new(
            ToolExecutor::new(collab.sandbox.clone(), cfg.sandbox.timeout_secs),
            collab.validator.clone(),
            collab.extractor.clone(),
            assessor.clone(),
        )
        .with_output_limit(cfg.compression.tool_output_limit);
        if cfg.control.oracle_confidence {
            tool_runner = tool_runner.with_confidence_oracle(collab.evaluation_oracle.clone(), oracle_timeout);
        }

        Self {
            planner: Planner::new(collab.planner_oracle.clone(), oracle_timeout),
            executor: Executor::new(collab.executor_oracle.clone(), oracle_timeout),
            tool_runner,
            reflector: Reflector::new(
                collab.evaluation_oracle.clone(),
                collab.validator.clone(),
                collab.extractor.clone(),
                oracle_timeout,
            )
            .with_strategic_streak(cfg.reflector.strategic_streak),
            router: Router::new(RoutingPolicy::from_config(&cfg.control), assessor, collab.validator.clone()),
            compressor: ContextCompressor::new(cfg.compression.max_entries, cfg.compression.max_bytes),
            compression_enabled: cfg.compression.enabled,
            keep_recent: cfg.compression.keep_recent,
            extractor: collab.extractor,
            usage_sources: vec![
                (OracleRole::Planner, collab.planner_oracle),
                (OracleRole::Executor, collab.executor_oracle),
                (OracleRole::Reflector, collab.evaluation_oracle),
            ],
            step_ceiling_factor: cfg.control.step_ceiling_factor.max(1),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<LoopEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// 全局步数上限，独立于 max_attempts
    pub fn step_ceiling(&self, state: &SessionState) -> u32 {
        state.max_attempts.saturating_mul(self.step_ceiling_factor).max(1)
    }

    /// 读取各角色预言机的累计 token 用量
    pub fn token_usage(&self) -> BTreeMap<OracleRole, TokenCount> {
        self.usage_sources
            .iter()
            .filter_map(|(role, oracle)| oracle.token_usage().map(|t| (*role, t)))
            .collect()
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// 驱动状态机直到 END；无论节点行为如何都会返回
    pub async fn run(&self, state: &mut SessionState) -> RunOutcome {
        let ceiling = self.step_ceiling(state);
        let mut node = NodeId::Planner;
        let mut steps: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                state.terminate(RunStatus::Exhausted, "cancelled");
                break;
            }
            if state.terminated || node == NodeId::End {
                break;
            }
            if steps >= ceiling {
                state.terminate(
                    RunStatus::Exhausted,
                    format!("budget exhausted: step ceiling {ceiling} reached"),
                );
                break;
            }
            steps += 1;

            if matches!(node, NodeId::Planner | NodeId::Executor) {
                self.maybe_compress(state);
            }

            tracing::info!(step = steps, node = %node, attempts = state.attempt_count, "node start");
            self.emit(LoopEvent::NodeStarted {
                step: steps,
                node: node.to_string(),
            });

            match self.run_node(node, state).await {
                Ok(update) => {
                    self.emit_update_events(&update);
                    state.apply(update);
                }
                Err(AgentError::Cancelled) => {
                    state.terminate(RunStatus::Exhausted, "cancelled");
                    break;
                }
                Err(e) => {
                    tracing::error!(node = %node, error = %e, "node failed, aborting run");
                    state.terminate(RunStatus::Error, format!("{node} failed: {e}"));
                    break;
                }
            }

            let decision = match node {
                NodeId::Planner => RouteDecision {
                    next: NodeId::Executor,
                    reason: RouteReason::Default,
                },
                NodeId::ToolRunner => RouteDecision {
                    next: NodeId::Reflector,
                    reason: RouteReason::Default,
                },
                NodeId::Executor => self.router.decide(state),
                NodeId::Reflector => self.router.decide_after_reflection(state),
                NodeId::End => break,
            };
            tracing::info!(from = %node, to = %decision.next, reason = %decision.reason, "route");
            self.emit(LoopEvent::RouteDecided {
                from: node.to_string(),
                to: decision.next.to_string(),
                reason: decision.reason.to_string(),
            });
            if decision.next == NodeId::End {
                self.finish(state, decision.reason);
            }
            node = decision.next;
        }

        if !state.terminated {
            state.terminate(RunStatus::Exhausted, "loop ended without a terminal decision");
        }
        let (status, reason) = state
            .termination
            .as_ref()
            .map(|t| (t.status, t.reason.clone()))
            .unwrap_or((RunStatus::Error, "missing termination".to_string()));
        self.emit(LoopEvent::Terminated {
            status: status.to_string(),
            reason: reason.clone(),
        });
        RunOutcome {
            status,
            reason,
            result: state.result.clone(),
            steps,
            attempts: state.attempt_count,
            token_usage: self.token_usage(),
        }
    }

    /// 把路由给出的 END 原因落成终止状态
    fn finish(&self, state: &mut SessionState, reason: RouteReason) {
        match reason {
            RouteReason::VerifiedArtifact(artifact) => {
                state.apply(StateUpdate {
                    submitted: vec![artifact.clone()],
                    result: Some(artifact),
                    ..Default::default()
                });
                state.terminate(RunStatus::Verified, "validated artifact observed in recent results");
            }
            RouteReason::AttemptsExhausted => {
                state.terminate(RunStatus::Exhausted, "budget exhausted: max attempts reached");
            }
            RouteReason::StrategicFailure => {
                let cause = state
                    .failure_history
                    .last()
                    .map(|v| v.root_cause.clone())
                    .unwrap_or_default();
                state.terminate(RunStatus::StrategicFailure, format!("strategic failure (L5): {cause}"));
            }
            RouteReason::Terminated if state.result.is_some() => {
                state.terminate(RunStatus::Verified, "result accepted by validator");
            }
            other => state.terminate(RunStatus::Exhausted, other.to_string()),
        }
    }

    /// 运行单个节点；取消令牌触发时中止等待，panic 转为 NodePanicked
    async fn run_node(&self, node: NodeId, state: &SessionState) -> Result<StateUpdate, AgentError> {
        let work = async {
            match node {
                NodeId::Planner => self.planner.run(state).await,
                NodeId::Executor => self.executor.run(state).await,
                NodeId::ToolRunner => self.tool_runner.run(state).await,
                NodeId::Reflector => self.reflector.run(state).await,
                NodeId::End => Ok(StateUpdate::default()),
            }
        };
        let guarded = AssertUnwindSafe(work).catch_unwind();
        tokio::select! {
            outcome = guarded => match outcome {
                Ok(result) => result,
                Err(panic) => Err(AgentError::NodePanicked(panic_message(panic.as_ref()))),
            },
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }

    fn maybe_compress(&self, state: &mut SessionState) {
        if !self.compression_enabled || !self.compressor.should_compress(&state.transcript) {
            return;
        }
        let warning = state.recent_requests.warning();
        let compression = self.compressor.compress(
            &state.transcript,
            self.keep_recent,
            &mut state.discoveries,
            self.extractor.as_ref(),
            warning.as_deref(),
        );
        if compression.summarized > 0 {
            state.transcript = compression.entries;
            self.emit(LoopEvent::Compressed {
                summarized: compression.summarized,
                new_facts: compression.new_facts,
            });
        }
    }

    fn emit_update_events(&self, update: &StateUpdate) {
        if self.events.is_none() {
            return;
        }
        for entry in &update.entries {
            match entry {
                TranscriptEntry::ActionRequest(req) => self.emit(LoopEvent::ActionDispatched {
                    id: req.id,
                    tool: req.tool.clone(),
                    args: req.args.clone(),
                }),
                TranscriptEntry::ActionResult(res) => self.emit(LoopEvent::Observation {
                    id: res.request_id,
                    exit_status: res.exit_status,
                    preview: res.output.chars().take(PREVIEW_CHARS).collect(),
                }),
                _ => {}
            }
        }
        if let Some(v) = &update.verdict {
            self.emit(LoopEvent::Verdict {
                summary: v.summary_line(),
            });
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
