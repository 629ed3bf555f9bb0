//! Planner：重新规划节点
//!
//! 汇总目标、discoveries、失败历史、动作历史与当前置信策略，请求规划预言机给出指导，
//! 写入 pending_guidance。预言机不可用时给出兜底指导，让执行者自主决策。

use std::sync::Arc;
use std::time::Duration;

use crate::core::state::{GuidanceChange, SessionState, StateUpdate};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::memory::transcript::TranscriptEntry;
use crate::react::oracle::{invoke_with_timeout, DecisionOracle, OracleRole, TranscriptView};
use crate::signals::confidence::ConfidenceAssessor;

pub const FALLBACK_GUIDANCE: &str = "planner unavailable, decide autonomously";

/// 每类 discoveries 在规划上下文中列出的条数
const DISCOVERIES_PER_CATEGORY: usize = 10;

pub struct Planner {
    oracle: Arc<dyn DecisionOracle>,
    timeout: Duration,
    recovery: RecoveryEngine,
}

impl Planner {
    pub fn new(oracle: Arc<dyn DecisionOracle>, timeout: Duration) -> Self {
        Self {
            oracle,
            timeout,
            recovery: RecoveryEngine::new(),
        }
    }

    /// 规划上下文：策略、警告、事实、失败与动作历史
    pub fn build_context(state: &SessionState) -> String {
        let strategy = ConfidenceAssessor::strategy_for(state.confidence_score);
        let mut s = format!(
            "## Status\nAttempt {}/{}; confidence {:.1}% ({}); consecutive failures {}\n{}\n",
            state.attempt_count,
            state.max_attempts,
            state.confidence_score,
            strategy,
            state.consecutive_failures,
            strategy.guidance(),
        );
        if let Some(warning) = state.recent_requests.warning() {
            s.push_str(&format!("\n## Warning\n{warning}\n"));
        }
        for section in [
            state.discoveries.to_prompt_context(DISCOVERIES_PER_CATEGORY),
            state.failure_history.to_prompt_section(),
            state.action_history.to_prompt_section(10),
        ] {
            if !section.is_empty() {
                s.push('\n');
                s.push_str(&section);
            }
        }
        if state.guidance_requested {
            s.push_str("\nThe executor explicitly asked for new guidance.\n");
        }
        s.push_str("\nWrite the guidance for the next steps.");
        s
    }

    pub async fn run(&self, state: &SessionState) -> Result<StateUpdate, AgentError> {
        let view = TranscriptView::new(&state.objective, &state.transcript, Self::build_context(state));
        let guidance = match invoke_with_timeout(self.oracle.as_ref(), OracleRole::Planner, &view, self.timeout).await {
            Ok(reply) if !reply.text.trim().is_empty() => reply.text,
            Ok(_) => {
                tracing::warn!("Planner returned empty guidance");
                FALLBACK_GUIDANCE.to_string()
            }
            Err(e) => match self.recovery.handle(&e) {
                RecoveryAction::Abort => return Err(e),
                action => {
                    tracing::warn!("Planner oracle failed ({:?}), using fallback guidance", action);
                    FALLBACK_GUIDANCE.to_string()
                }
            },
        };
        tracing::info!(chars = guidance.len(), "planner guidance ready");

        Ok(StateUpdate {
            entries: vec![TranscriptEntry::PlannerNote {
                text: guidance.clone(),
            }],
            guidance: Some(GuidanceChange::Set(guidance)),
            guidance_requested: Some(false),
            last_escalation_at_failures: Some(state.consecutive_failures),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Objective;
    use crate::react::oracle::{parse_oracle_output, OracleReply};
    use async_trait::async_trait;

    struct Reply(&'static str);

    #[async_trait]
    impl DecisionOracle for Reply {
        async fn invoke(&self, _role: OracleRole, view: &TranscriptView<'_>) -> Result<OracleReply, AgentError> {
            assert!(view.context.contains("## Status"));
            Ok(parse_oracle_output(self.0))
        }
    }

    struct Timeout;

    #[async_trait]
    impl DecisionOracle for Timeout {
        async fn invoke(&self, _role: OracleRole, _view: &TranscriptView<'_>) -> Result<OracleReply, AgentError> {
            Err(AgentError::OracleTimeout(60))
        }
    }

    fn state() -> SessionState {
        let mut s = SessionState::new(Objective::new("http://t", "find the flag"), 20);
        s.consecutive_failures = 4;
        s.guidance_requested = true;
        s
    }

    #[tokio::test]
    async fn test_guidance_is_set_and_escalation_marked() {
        let planner = Planner::new(Arc::new(Reply("Enumerate /api first.")), Duration::from_secs(5));
        let s = state();
        let update = planner.run(&s).await.unwrap();
        assert_eq!(update.guidance, Some(GuidanceChange::Set("Enumerate /api first.".into())));
        assert_eq!(update.guidance_requested, Some(false));
        assert_eq!(update.last_escalation_at_failures, Some(4));
        assert!(matches!(&update.entries[0], TranscriptEntry::PlannerNote { .. }));
    }

    #[tokio::test]
    async fn test_oracle_failure_yields_fallback_guidance() {
        let planner = Planner::new(Arc::new(Timeout), Duration::from_secs(5));
        let update = planner.run(&state()).await.unwrap();
        assert_eq!(update.guidance, Some(GuidanceChange::Set(FALLBACK_GUIDANCE.into())));
    }

    #[test]
    fn test_context_reflects_strategy_and_warning() {
        let mut s = state();
        s.confidence_score = 30.0;
        let ctx = Planner::build_context(&s);
        assert!(ctx.contains("INFORMATION_GATHERING"));
        assert!(ctx.contains("explicitly asked"));
    }
}
