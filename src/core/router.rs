//! 路由：根据会话状态决定下一个节点
//!
//! 纯函数，按固定优先级逐条匹配（先命中者生效）。路由从不 panic，也不返回错误：
//! 任何内部不一致（如阈值为 0）都记录警告并回到 EXECUTOR。

use std::fmt;
use std::sync::Arc;

use crate::config::{CheckpointTier, ControlSection};
use crate::core::state::{NodeId, SessionState};
use crate::memory::transcript::{pending_request, TranscriptEntry};
use crate::react::reflector::FailureLevel;
use crate::signals::confidence::ConfidenceAssessor;
use crate::signals::repetition::RepetitionPattern;
use crate::tools::validator::ResultValidator;

/// 路由阈值
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    pub failure_threshold: u32,
    pub checkpoint_interval: u32,
    /// 按 from_attempt 升序
    pub checkpoint_tiers: Vec<CheckpointTier>,
    pub verified_lookback: usize,
    pub no_progress_after: u32,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self::from_config(&ControlSection::default())
    }
}

impl RoutingPolicy {
    pub fn from_config(control: &ControlSection) -> Self {
        let mut tiers = control.checkpoint_tiers.clone();
        tiers.sort_by_key(|t| t.from_attempt);
        Self {
            failure_threshold: control.failure_threshold,
            checkpoint_interval: control.checkpoint_interval,
            checkpoint_tiers: tiers,
            verified_lookback: control.verified_lookback,
            no_progress_after: control.no_progress_after,
        }
    }

    /// 动态阈值：失败数达到 2T 后缩小为 2
    pub fn effective_threshold(&self, failures: u32) -> u32 {
        let base = self.failure_threshold;
        if base > 2 && failures >= base.saturating_mul(2) {
            2
        } else {
            base
        }
    }

    /// 当前尝试数对应的检查点间隔
    pub fn checkpoint_interval_for(&self, attempts: u32) -> u32 {
        self.checkpoint_tiers
            .iter()
            .filter(|t| attempts >= t.from_attempt)
            .last()
            .map(|t| t.interval)
            .unwrap_or(self.checkpoint_interval)
    }
}

/// 路由原因（用于日志与事件）
#[derive(Debug, Clone, PartialEq)]
pub enum RouteReason {
    Terminated,
    VerifiedArtifact(String),
    AttemptsExhausted,
    PendingAction,
    LowConfidence,
    Repetition(RepetitionPattern),
    FailureThreshold { failures: u32, threshold: u32 },
    NoProgress,
    GuidanceRequested,
    Checkpoint { interval: u32 },
    StrategicFailure,
    Reconsult,
    Default,
    Inconsistent(String),
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminated => write!(f, "terminated"),
            Self::VerifiedArtifact(a) => write!(f, "verified artifact {a}"),
            Self::AttemptsExhausted => write!(f, "attempts exhausted"),
            Self::PendingAction => write!(f, "pending action"),
            Self::LowConfidence => write!(f, "confidence escalation"),
            Self::Repetition(p) => write!(f, "repetition {p}"),
            Self::FailureThreshold { failures, threshold } => {
                write!(f, "{failures} consecutive failures (threshold {threshold})")
            }
            Self::NoProgress => write!(f, "no progress"),
            Self::GuidanceRequested => write!(f, "guidance requested"),
            Self::Checkpoint { interval } => write!(f, "checkpoint every {interval}"),
            Self::StrategicFailure => write!(f, "strategic failure"),
            Self::Reconsult => write!(f, "re-consult planner"),
            Self::Default => write!(f, "default"),
            Self::Inconsistent(why) => write!(f, "inconsistent state: {why}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub next: NodeId,
    pub reason: RouteReason,
}

impl RouteDecision {
    fn new(next: NodeId, reason: RouteReason) -> Self {
        Self { next, reason }
    }
}

pub struct Router {
    policy: RoutingPolicy,
    assessor: ConfidenceAssessor,
    validator: Arc<dyn ResultValidator>,
}

impl Router {
    pub fn new(policy: RoutingPolicy, assessor: ConfidenceAssessor, validator: Arc<dyn ResultValidator>) -> Self {
        Self {
            policy,
            assessor,
            validator,
        }
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    pub fn route(&self, state: &SessionState) -> NodeId {
        self.decide(state).next
    }

    pub fn route_after_reflection(&self, state: &SessionState) -> NodeId {
        self.decide_after_reflection(state).next
    }

    /// EXECUTOR 之后的路由
    pub fn decide(&self, state: &SessionState) -> RouteDecision {
        if let Some(end) = self.terminal(state) {
            return end;
        }
        if pending_request(&state.transcript).is_some() {
            return RouteDecision::new(NodeId::ToolRunner, RouteReason::PendingAction);
        }
        if self.policy.failure_threshold == 0 || self.policy.checkpoint_interval_for(state.attempt_count) == 0 {
            tracing::warn!("Routing thresholds must be positive; defaulting to executor");
            return RouteDecision::new(
                NodeId::Executor,
                RouteReason::Inconsistent("zero threshold or interval".to_string()),
            );
        }
        if let Some(reason) = self.escalation(state) {
            return RouteDecision::new(NodeId::Planner, reason);
        }
        if state.guidance_requested {
            return RouteDecision::new(NodeId::Planner, RouteReason::GuidanceRequested);
        }
        let interval = self.policy.checkpoint_interval_for(state.attempt_count);
        if state.attempt_count > 0 && state.attempt_count % interval == 0 {
            return RouteDecision::new(NodeId::Planner, RouteReason::Checkpoint { interval });
        }
        RouteDecision::new(NodeId::Executor, RouteReason::Default)
    }

    /// REFLECTOR 之后的路由：只会去 PLANNER、TOOL_RUNNER（待提交结果）或 END
    pub fn decide_after_reflection(&self, state: &SessionState) -> RouteDecision {
        if let Some(end) = self.terminal(state) {
            return end;
        }
        if pending_request(&state.transcript).is_some() {
            return RouteDecision::new(NodeId::ToolRunner, RouteReason::PendingAction);
        }
        let strategic = state
            .failure_history
            .last()
            .and_then(|v| v.level)
            .is_some_and(|l| l == FailureLevel::L5);
        if strategic {
            return RouteDecision::new(NodeId::End, RouteReason::StrategicFailure);
        }
        RouteDecision::new(NodeId::Planner, RouteReason::Reconsult)
    }

    /// 规则 1-3：终止、已验证结果、尝试耗尽
    fn terminal(&self, state: &SessionState) -> Option<RouteDecision> {
        if state.terminated || state.result.is_some() {
            return Some(RouteDecision::new(NodeId::End, RouteReason::Terminated));
        }
        if let Some(artifact) = self.verified_artifact(state) {
            return Some(RouteDecision::new(NodeId::End, RouteReason::VerifiedArtifact(artifact)));
        }
        if state.attempt_count >= state.max_attempts {
            return Some(RouteDecision::new(NodeId::End, RouteReason::AttemptsExhausted));
        }
        None
    }

    /// 最近 K 条结果中经验证器确认的候选
    fn verified_artifact(&self, state: &SessionState) -> Option<String> {
        let skip = state.transcript.len().saturating_sub(self.policy.verified_lookback);
        state.transcript[skip..]
            .iter()
            .rev()
            .filter_map(|e| match e {
                TranscriptEntry::ActionResult(res) => Some(res),
                _ => None,
            })
            .flat_map(|res| self.validator.candidates(&res.output))
            .find(|c| self.validator.verify(c))
    }

    /// 规则 5：置信度、重复、无进展、动态失败阈值
    fn escalation(&self, state: &SessionState) -> Option<RouteReason> {
        if self.assessor.should_escalate(state) {
            return Some(RouteReason::LowConfidence);
        }
        if let Some(pattern) = state.recent_requests.detect() {
            return Some(RouteReason::Repetition(pattern));
        }
        let window = self.policy.no_progress_after;
        if window > 0
            && state.attempt_count >= window
            && state.action_history.len() >= window as usize
            && state.action_history.successes_in_last(window as usize) == 0
        {
            return Some(RouteReason::NoProgress);
        }
        let failures = state.consecutive_failures;
        let threshold = self.policy.effective_threshold(failures);
        if failures > 0 && failures % threshold == 0 && failures != state.last_escalation_at_failures {
            return Some(RouteReason::FailureThreshold { failures, threshold });
        }
        None
    }
}
