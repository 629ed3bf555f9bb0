//! 会话状态：贯穿每一步的唯一可变记录
//!
//! 只有编排器持有 `&mut SessionState`；各节点读取 `&SessionState` 并返回 StateUpdate，由编排器合并。

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::memory::discoveries::{Discovery, DiscoveryStore};
use crate::memory::transcript::TranscriptEntry;
use crate::memory::working::{ActionHistory, ActionRecord};
use crate::react::reflector::{FailureHistory, Verdict};
use crate::signals::confidence::{ConfidenceAssessor, ConfidenceTier};
use crate::signals::repetition::{RepetitionDetector, RequestRecord};

/// 任务目标（创建后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub target: String,
    pub goal: String,
    pub reference_id: Option<String>,
}

impl Objective {
    pub fn new(target: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            goal: goal.into(),
            reference_id: None,
        }
    }

    pub fn with_reference_id(mut self, id: impl Into<String>) -> Self {
        self.reference_id = Some(id.into());
        self
    }

    pub fn to_prompt_section(&self) -> String {
        let mut s = format!("## Objective\nTarget: {}\nGoal: {}\n", self.target, self.goal);
        if let Some(id) = &self.reference_id {
            s.push_str(&format!("Reference: {id}\n"));
        }
        s
    }
}

/// 状态机节点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Planner,
    Executor,
    ToolRunner,
    Reflector,
    End,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeId::Planner => "PLANNER",
            NodeId::Executor => "EXECUTOR",
            NodeId::ToolRunner => "TOOL_RUNNER",
            NodeId::Reflector => "REFLECTOR",
            NodeId::End => "END",
        };
        f.write_str(s)
    }
}

/// 运行的最终状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Verified,
    Exhausted,
    StrategicFailure,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Verified => "verified",
            RunStatus::Exhausted => "exhausted",
            RunStatus::StrategicFailure => "strategic-failure",
            RunStatus::Error => "error",
        }
    }

    /// 只有编排错误返回非零
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Error => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 终止原因（结构化）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Termination {
    pub status: RunStatus,
    pub reason: String,
}

/// Planner 指导的变更
#[derive(Debug, Clone, PartialEq)]
pub enum GuidanceChange {
    Set(String),
    Clear,
}

/// 节点返回的部分更新
#[derive(Debug, Default)]
pub struct StateUpdate {
    pub entries: Vec<TranscriptEntry>,
    pub guidance: Option<GuidanceChange>,
    pub guidance_requested: Option<bool>,
    pub count_attempt: bool,
    pub consecutive_failures: Option<u32>,
    pub last_escalation_at_failures: Option<u32>,
    /// (新分数, 公式轨迹)
    pub confidence: Option<(f64, String)>,
    pub discoveries: Vec<Discovery>,
    pub action_record: Option<ActionRecord>,
    pub request_record: Option<RequestRecord>,
    /// 追加到失败历史，同时写入转写
    pub verdict: Option<Verdict>,
    pub submitted: Vec<String>,
    pub result: Option<String>,
    pub termination: Option<Termination>,
}

/// 会话状态
#[derive(Debug, Clone)]
pub struct SessionState {
    pub objective: Objective,
    pub transcript: Vec<TranscriptEntry>,
    pub result: Option<String>,
    pub terminated: bool,
    pub termination: Option<Termination>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub consecutive_failures: u32,
    pub last_escalation_at_failures: u32,
    pub confidence_score: f64,
    pub confidence_trace: Option<String>,
    pub discoveries: DiscoveryStore,
    pub action_history: ActionHistory,
    pub pending_guidance: Option<String>,
    /// Executor 明确请求了 Planner 指导
    pub guidance_requested: bool,
    pub recent_requests: RepetitionDetector,
    pub failure_history: FailureHistory,
    /// 已提交过的候选结果，每个只提交一次
    pub submitted_artifacts: BTreeSet<String>,
    next_request_id: u64,
}

impl SessionState {
    pub fn new(objective: Objective, max_attempts: u32) -> Self {
        Self {
            objective,
            transcript: Vec::new(),
            result: None,
            terminated: false,
            termination: None,
            attempt_count: 0,
            max_attempts,
            consecutive_failures: 0,
            last_escalation_at_failures: 0,
            confidence_score: 50.0,
            confidence_trace: None,
            discoveries: DiscoveryStore::new(),
            action_history: ActionHistory::new(20),
            pending_guidance: None,
            guidance_requested: false,
            recent_requests: RepetitionDetector::default(),
            failure_history: FailureHistory::new(10),
            submitted_artifacts: BTreeSet::new(),
            next_request_id: 1,
        }
    }

    pub fn with_initial_confidence(mut self, score: f64) -> Self {
        self.confidence_score = score.clamp(0.0, 100.0);
        self
    }

    pub fn with_repetition_detector(mut self, detector: RepetitionDetector) -> Self {
        self.recent_requests = detector;
        self
    }

    pub fn with_action_history(mut self, history: ActionHistory) -> Self {
        self.action_history = history;
        self
    }

    pub fn with_failure_history(mut self, history: FailureHistory) -> Self {
        self.failure_history = history;
        self
    }

    pub fn confidence_tier(&self) -> ConfidenceTier {
        ConfidenceAssessor::tier(self.confidence_score)
    }

    /// 下一个可用的请求 id
    pub fn next_request_id(&self) -> u64 {
        self.next_request_id
    }

    /// 终止运行；首次终止的原因生效
    pub fn terminate(&mut self, status: RunStatus, reason: impl Into<String>) {
        if self.termination.is_none() {
            let reason = reason.into();
            tracing::info!(status = %status, reason = %reason, "session terminated");
            self.termination = Some(Termination { status, reason });
        }
        self.terminated = true;
    }

    /// 合并节点返回的部分更新
    pub fn apply(&mut self, update: StateUpdate) {
        if let Some(verdict) = update.verdict {
            self.failure_history.push(verdict.clone());
            self.transcript.push(TranscriptEntry::Verdict(verdict));
        }
        for entry in update.entries {
            if let TranscriptEntry::ActionRequest(req) = &entry {
                self.next_request_id = self.next_request_id.max(req.id + 1);
            }
            self.transcript.push(entry);
        }
        match update.guidance {
            Some(GuidanceChange::Set(text)) => self.pending_guidance = Some(text),
            Some(GuidanceChange::Clear) => self.pending_guidance = None,
            None => {}
        }
        if let Some(requested) = update.guidance_requested {
            self.guidance_requested = requested;
        }
        if update.count_attempt {
            self.attempt_count += 1;
        }
        if let Some(n) = update.consecutive_failures {
            self.consecutive_failures = n;
        }
        if let Some(n) = update.last_escalation_at_failures {
            self.last_escalation_at_failures = n;
        }
        if let Some((score, trace)) = update.confidence {
            self.confidence_score = score.clamp(0.0, 100.0);
            self.confidence_trace = Some(trace);
        }
        self.discoveries.extend(update.discoveries);
        if let Some(record) = update.action_record {
            self.action_history.push(record);
        }
        if let Some(record) = update.request_record {
            self.recent_requests.push(record);
        }
        self.submitted_artifacts.extend(update.submitted);
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(t) = update.termination {
            self.terminate(t.status, t.reason);
        }
    }
}
