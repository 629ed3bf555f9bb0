//! 置信度评估
//!
//! 每步按结果分类施加固定增量（成功 +20、失败 -30、模糊 -10），夹取到 [0, 100]，
//! 并映射为三档策略。可选的预言机版本在任何解析失败时回退到纯启发式。

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::state::{Objective, SessionState};
use crate::memory::transcript::TranscriptEntry;
use crate::react::oracle::{extract_json_block, invoke_with_timeout, DecisionOracle, OracleRole, TranscriptView};

pub const SUCCESS_DELTA: f64 = 20.0;
pub const FAILURE_DELTA: f64 = -30.0;
pub const AMBIGUOUS_DELTA: f64 = -10.0;

const SUCCESS_INDICATORS: &[&str] = &[
    "success",
    "found",
    "flag{",
    "200 ok",
    "access granted",
];

const FAILURE_INDICATORS: &[&str] = &[
    "error",
    "failed",
    "denied",
    "forbidden",
    "timeout",
    "incorrect",
    "wrong",
];

/// 否定形式的成功词：先从文本中剔除，再计为失败（"404 Not Found" 不是成功）
const NEGATED_SUCCESS: &[&str] = &["not found", "unsuccessful", "no success"];

/// 失败状态码按词边界匹配，"1500" 之类的数字不算
const FAILURE_STATUS_CODES: &str = r"\b(401|403|404|500)\b";

/// 单步结果分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Ambiguous,
}

impl Outcome {
    pub fn delta(&self) -> f64 {
        match self {
            Outcome::Success => SUCCESS_DELTA,
            Outcome::Failure => FAILURE_DELTA,
            Outcome::Ambiguous => AMBIGUOUS_DELTA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

impl ConfidenceTier {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            ConfidenceTier::High
        } else if score >= 50.0 {
            ConfidenceTier::Medium
        } else {
            ConfidenceTier::Low
        }
    }
}

/// 与置信档位一一对应的策略建议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    DirectExecute,
    ParallelHypothesis,
    InformationGathering,
}

impl Strategy {
    pub fn guidance(&self) -> &'static str {
        match self {
            Strategy::DirectExecute => "Confidence is high: execute the current plan directly.",
            Strategy::ParallelHypothesis => {
                "Confidence is medium: keep two or three hypotheses and test them in turn."
            }
            Strategy::InformationGathering => {
                "Confidence is low: stop attacking and gather more information about the target first."
            }
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::DirectExecute => "DIRECT_EXECUTE",
            Strategy::ParallelHypothesis => "PARALLEL_HYPOTHESIS",
            Strategy::InformationGathering => "INFORMATION_GATHERING",
        };
        f.write_str(s)
    }
}

/// 置信度评估器：纯函数，分数本身保存在 SessionState 中
#[derive(Debug, Clone)]
pub struct ConfidenceAssessor {
    success_indicators: Vec<String>,
    failure_indicators: Vec<String>,
    /// 中档时触发升级所需的连续失败数
    escalation_failures: u32,
}

impl Default for ConfidenceAssessor {
    fn default() -> Self {
        Self::new(3)
    }
}

impl ConfidenceAssessor {
    pub fn new(escalation_failures: u32) -> Self {
        Self {
            success_indicators: SUCCESS_INDICATORS.iter().map(|s| s.to_string()).collect(),
            failure_indicators: FAILURE_INDICATORS.iter().map(|s| s.to_string()).collect(),
            escalation_failures,
        }
    }

    /// 成功指示优先于失败指示
    pub fn classify(&self, text: &str) -> Outcome {
        static STATUS_CODE: OnceLock<Option<Regex>> = OnceLock::new();

        let lower = text.to_lowercase();
        let negated = NEGATED_SUCCESS.iter().any(|n| lower.contains(n));
        let scrubbed = NEGATED_SUCCESS
            .iter()
            .fold(lower.clone(), |acc, n| acc.replace(n, " "));
        let status_failure = STATUS_CODE
            .get_or_init(|| Regex::new(FAILURE_STATUS_CODES).ok())
            .as_ref()
            .is_some_and(|re| re.is_match(&lower));

        if self.success_indicators.iter().any(|i| scrubbed.contains(i.as_str())) {
            Outcome::Success
        } else if negated
            || status_failure
            || self.failure_indicators.iter().any(|i| lower.contains(i.as_str()))
        {
            Outcome::Failure
        } else {
            Outcome::Ambiguous
        }
    }

    /// 返回 (新分数, 公式轨迹)，如 `90.0% - 30% = 60.0%`
    pub fn update(&self, previous: f64, outcome_text: &str) -> (f64, String) {
        Self::apply(previous, self.classify(outcome_text))
    }

    pub fn apply(previous: f64, outcome: Outcome) -> (f64, String) {
        let previous = if previous.is_finite() {
            previous.clamp(0.0, 100.0)
        } else {
            50.0
        };
        let delta = outcome.delta();
        let score = (previous + delta).clamp(0.0, 100.0);
        let sign = if delta >= 0.0 { '+' } else { '-' };
        let trace = format!("{:.1}% {} {}% = {:.1}%", previous, sign, delta.abs(), score);
        (score, trace)
    }

    pub fn tier(score: f64) -> ConfidenceTier {
        ConfidenceTier::from_score(score)
    }

    /// 低档，或中档且连续失败达到阈值
    pub fn should_escalate(&self, state: &SessionState) -> bool {
        match state.confidence_tier() {
            ConfidenceTier::Low => true,
            ConfidenceTier::Medium => state.consecutive_failures >= self.escalation_failures,
            ConfidenceTier::High => false,
        }
    }

    pub fn strategy_for(score: f64) -> Strategy {
        match ConfidenceTier::from_score(score) {
            ConfidenceTier::High => Strategy::DirectExecute,
            ConfidenceTier::Medium => Strategy::ParallelHypothesis,
            ConfidenceTier::Low => Strategy::InformationGathering,
        }
    }

    /// 预言机版本：请求评估预言机给出 `{"outcome": "success|failure|ambiguous"}`，
    /// 调用失败或输出无法解码时回退到 `update`
    pub async fn update_with_oracle(
        &self,
        oracle: &dyn DecisionOracle,
        objective: &Objective,
        previous: f64,
        outcome_text: &str,
        timeout: Duration,
    ) -> (f64, String) {
        let entries = [TranscriptEntry::ExecutorNote {
            text: outcome_text.to_string(),
        }];
        let view = TranscriptView::new(objective, &entries, String::new());
        let reply = match invoke_with_timeout(oracle, OracleRole::Assessor, &view, timeout).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Confidence oracle failed ({}), using heuristic", e);
                return self.update(previous, outcome_text);
            }
        };
        match decode_outcome(&reply.text) {
            Some(outcome) => Self::apply(previous, outcome),
            None => {
                tracing::warn!("Confidence oracle output not decodable, using heuristic");
                self.update(previous, outcome_text)
            }
        }
    }
}

#[derive(Deserialize)]
struct OutcomePayload {
    outcome: Outcome,
}

fn decode_outcome(text: &str) -> Option<Outcome> {
    let json = extract_json_block(text)?;
    serde_json::from_str::<OutcomePayload>(json)
        .ok()
        .map(|p| p.outcome)
}
