//! Executor：执行节点
//!
//! 按当前指导请求执行预言机给出下一步动作。给出结构化动作时写入 ActionRequest 并消费指导；
//! 只有文本时记为 ExecutorNote，文本中含 `[REQUEST_GUIDANCE]` 视为请求 Planner。
//! 预言机输出无法使用（解析失败、被拒绝）时同样记为 ExecutorNote 并请求指导，只有 Abort 类错误上抛。

use std::sync::Arc;
use std::time::Duration;

use crate::core::state::{GuidanceChange, SessionState, StateUpdate};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::memory::transcript::{ActionRequest, TranscriptEntry};
use crate::react::oracle::{invoke_with_timeout, DecisionOracle, OracleRole, TranscriptView};
use crate::react::reflector::Verdict;
use crate::signals::confidence::ConfidenceAssessor;

pub const GUIDANCE_MARKER: &str = "[REQUEST_GUIDANCE]";

pub struct Executor {
    oracle: Arc<dyn DecisionOracle>,
    timeout: Duration,
    recovery: RecoveryEngine,
}

impl Executor {
    pub fn new(oracle: Arc<dyn DecisionOracle>, timeout: Duration) -> Self {
        Self {
            oracle,
            timeout,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn build_context(state: &SessionState) -> String {
        let mut s = String::new();
        if let Some(guidance) = &state.pending_guidance {
            s.push_str(&format!("## Guidance\n{guidance}\n\n"));
        }
        let strategy = ConfidenceAssessor::strategy_for(state.confidence_score);
        s.push_str(&format!("## Strategy\n{strategy}: {}\n", strategy.guidance()));
        if let Some(warning) = state.recent_requests.warning() {
            s.push_str(&format!("\n## Warning\n{warning}\n"));
        }
        let discoveries = state.discoveries.to_prompt_context(5);
        if !discoveries.is_empty() {
            s.push('\n');
            s.push_str(&discoveries);
        }
        let tried = state.action_history.to_prompt_section(5);
        if !tried.is_empty() {
            s.push('\n');
            s.push_str(&tried);
        }
        s.push_str(&format!(
            "\nAttempt {}/{}. Reply with one JSON action, or {GUIDANCE_MARKER} if you need new guidance.",
            state.attempt_count + 1,
            state.max_attempts
        ));
        s
    }

    pub async fn run(&self, state: &SessionState) -> Result<StateUpdate, AgentError> {
        let view = TranscriptView::new(&state.objective, &state.transcript, Self::build_context(state));
        let reply = match invoke_with_timeout(self.oracle.as_ref(), OracleRole::Executor, &view, self.timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                return match self.recovery.handle(&e) {
                    RecoveryAction::RecordTransportFailure(msg) => {
                        tracing::warn!("Executor oracle unavailable: {}", msg);
                        Ok(StateUpdate {
                            entries: vec![TranscriptEntry::ExecutorNote {
                                text: format!("oracle unavailable: {msg}"),
                            }],
                            verdict: Some(Verdict::transport_failure(msg)),
                            guidance_requested: Some(true),
                            consecutive_failures: Some(state.consecutive_failures + 1),
                            ..Default::default()
                        })
                    }
                    RecoveryAction::UseDefault(msg) | RecoveryAction::RejectAction(msg) => {
                        tracing::warn!("Executor reply unusable, asking the planner: {}", msg);
                        Ok(StateUpdate {
                            entries: vec![TranscriptEntry::ExecutorNote { text: msg }],
                            guidance_requested: Some(true),
                            ..Default::default()
                        })
                    }
                    RecoveryAction::Abort => Err(e),
                };
            }
        };

        match reply.action {
            Some(draft) => {
                let request = ActionRequest::new(state.next_request_id(), draft.tool, draft.args);
                tracing::info!(id = request.id, tool = %request.tool, "executor emitted action");
                Ok(StateUpdate {
                    entries: vec![TranscriptEntry::ActionRequest(request)],
                    guidance: Some(GuidanceChange::Clear),
                    guidance_requested: Some(false),
                    ..Default::default()
                })
            }
            None => {
                let requested = reply.text.contains(GUIDANCE_MARKER);
                tracing::info!(guidance_requested = requested, "executor replied without an action");
                Ok(StateUpdate {
                    entries: vec![TranscriptEntry::ExecutorNote { text: reply.text }],
                    guidance_requested: Some(requested),
                    ..Default::default()
                })
            }
        }
    }
}
