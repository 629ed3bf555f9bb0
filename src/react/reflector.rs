//! Reflector：失败分级与情报抽取
//!
//! 对最近一次动作/结果做审计，产出结构化判定（VERIFIED / FAILED / PARTIAL + L0-L5）。
//! 评估预言机只给出建议等级，最终等级经过严格升级闸门：有低层证据时必须先归为低层，
//! L5 只有在连续 L4+ 达到阈值后才允许。自称成功但未经 ResultValidator 确认的判定降为 PARTIAL。

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::core::recovery::REJECTION_PREFIX;
use crate::core::state::{SessionState, StateUpdate};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::memory::discoveries::Discovery;
use crate::memory::transcript::{last_exchange, ActionRequest, ActionResult, TranscriptEntry};
use crate::react::oracle::{extract_json_block, invoke_with_timeout, DecisionOracle, OracleRole, TranscriptView};
use crate::tools::extractor::FactExtractor;
use crate::tools::validator::ResultValidator;

/// 传给评估预言机的最近转写条数
const VIEW_TAIL: usize = 6;
/// 上下文中附带的结果文本上限
const RESULT_EXCERPT: usize = 3000;

/// 失败等级，越大越接近「策略错误」
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FailureLevel {
    /// 原始观察，尚无失败
    L0,
    /// 工具 / 传输失败
    L1,
    /// 前置条件失败（认证、会话）
    L2,
    /// 环境干扰（WAF、限速、封禁）
    L3,
    /// 假设被证伪
    L4,
    /// 策略失败（终止）
    L5,
}

impl FailureLevel {
    /// 接受 "L3"、"3"、"l3"、"L3_ENVIRONMENT" 等写法
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        let s = s.strip_prefix(['L', 'l']).unwrap_or(s);
        let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        match digits.parse::<u8>().ok()? {
            0 => Some(Self::L0),
            1 => Some(Self::L1),
            2 => Some(Self::L2),
            3 => Some(Self::L3),
            4 => Some(Self::L4),
            5 => Some(Self::L5),
            _ => None,
        }
    }
}

impl fmt::Display for FailureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Verified,
    Failed,
    Partial,
}

impl VerdictStatus {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "VERIFIED" | "SUCCESS" => Self::Verified,
            "PARTIAL" => Self::Partial,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
        };
        f.write_str(s)
    }
}

/// 结构化判定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub level: Option<FailureLevel>,
    pub root_cause: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub extracted_intelligence: Vec<String>,
}

impl Verdict {
    /// 解析失败时的保守默认值
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Failed,
            confidence: 0.5,
            level: Some(FailureLevel::L1),
            root_cause: reason.into(),
            recommendations: Vec::new(),
            extracted_intelligence: Vec::new(),
        }
    }

    /// 预言机或沙箱不可达
    pub fn transport_failure(message: impl Into<String>) -> Self {
        let mut v = Self::fallback(message);
        v.recommendations
            .push("Check connectivity and tooling before changing the approach.".to_string());
        v
    }

    pub fn summary_line(&self) -> String {
        let level = self.level.map(|l| format!(" {l}")).unwrap_or_default();
        format!(
            "{}{} ({:.2}): {}",
            self.status, level, self.confidence, self.root_cause
        )
    }
}

/// 有界的判定历史
#[derive(Debug, Clone, Serialize)]
pub struct FailureHistory {
    entries: VecDeque<Verdict>,
    #[serde(skip)]
    capacity: usize,
}

impl FailureHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, verdict: Verdict) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(verdict);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Verdict> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&Verdict> {
        self.entries.back()
    }

    /// 末尾连续达到 min 等级的判定数
    pub fn trailing_streak(&self, min: FailureLevel) -> usize {
        self.entries
            .iter()
            .rev()
            .take_while(|v| v.level.is_some_and(|l| l >= min))
            .count()
    }

    pub fn to_prompt_section(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let mut s = String::from("## Failure history\n");
        for v in &self.entries {
            s.push_str(&format!("- {}\n", v.summary_line()));
        }
        s
    }
}

// ---------------------------------------------------------------------------
// 评估预言机的 JSON 负载
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, JsonSchema)]
pub struct VerdictPayload {
    pub audit_result: AuditSection,
    #[serde(default)]
    pub failure_analysis: FailureSection,
    #[serde(default)]
    pub intelligence: IntelligenceSection,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AuditSection {
    /// VERIFIED, FAILED or PARTIAL
    pub status: String,
    /// 0.0 - 1.0
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct FailureSection {
    /// L0 - L5
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub level: Option<serde_json::Value>,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct IntelligenceSection {
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub attack_vectors: Vec<String>,
}

fn default_confidence() -> f64 {
    0.5
}

/// 嵌入评估指令的 JSON Schema
pub fn verdict_schema() -> String {
    let schema = schemars::schema_for!(VerdictPayload);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 解码评估预言机输出：先整体解析，再尝试代码块 / 首个花括号对象
pub fn decode_verdict(text: &str) -> Option<Verdict> {
    let payload = serde_json::from_str::<VerdictPayload>(text.trim())
        .ok()
        .or_else(|| {
            extract_json_block(text).and_then(|json| serde_json::from_str::<VerdictPayload>(json).ok())
        })?;

    let mut confidence = payload.audit_result.confidence;
    if confidence > 1.0 {
        confidence /= 100.0;
    }
    let level = payload.failure_analysis.level.as_ref().and_then(|v| match v {
        serde_json::Value::String(s) => FailureLevel::parse(s),
        serde_json::Value::Number(n) => FailureLevel::parse(&n.to_string()),
        _ => None,
    });
    let root_cause = if payload.failure_analysis.root_cause.trim().is_empty() {
        payload.audit_result.reasoning
    } else {
        payload.failure_analysis.root_cause
    };
    let mut intel = payload.intelligence.key_findings;
    intel.extend(payload.intelligence.attack_vectors);
    intel.retain(|s| !s.trim().is_empty());

    Some(Verdict {
        status: VerdictStatus::parse(&payload.audit_result.status),
        confidence: if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.5
        },
        level,
        root_cause,
        recommendations: payload.failure_analysis.recommendations,
        extracted_intelligence: intel,
    })
}

// ---------------------------------------------------------------------------
// 严格升级闸门
// ---------------------------------------------------------------------------

/// 从结果中扫描出的低层证据
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvidenceSignals {
    pub transport: bool,
    pub precondition: bool,
    pub environment: bool,
}

const TRANSPORT_MARKERS: &[&str] = &[
    "connection refused",
    "could not resolve",
    "failed to connect",
    "command not found",
    "no such file or directory",
    "timed out",
    "network is unreachable",
    "syntaxerror",
];

const PRECONDITION_MARKERS: &[&str] = &[
    "unauthorized",
    "session expired",
    "login required",
    "invalid token",
    "expired token",
    "csrf",
    "not authenticated",
];

const ENVIRONMENT_MARKERS: &[&str] = &[
    "forbidden",
    "waf",
    "rate limit",
    "too many requests",
    "blocked",
    "captcha",
];

impl EvidenceSignals {
    pub fn scan(result: &ActionResult) -> Self {
        static PRECONDITION_CODE: OnceLock<Option<Regex>> = OnceLock::new();
        static ENVIRONMENT_CODE: OnceLock<Option<Regex>> = OnceLock::new();

        // 本地拒绝（禁用模式、未知工具）是工具层失败，文本里的 "forbidden" 不代表目标侧拦截
        if result.exit_status.is_none() && result.output.starts_with(REJECTION_PREFIX) {
            return Self {
                transport: true,
                ..Self::default()
            };
        }

        let lower = result.output.to_lowercase();
        let code_match = |cell: &OnceLock<Option<Regex>>, pattern: &str| {
            cell.get_or_init(|| Regex::new(pattern).ok())
                .as_ref()
                .is_some_and(|re| re.is_match(&lower))
        };
        Self {
            transport: result.timed_out
                || matches!(result.exit_status, Some(126) | Some(127))
                || TRANSPORT_MARKERS.iter().any(|m| lower.contains(m)),
            precondition: PRECONDITION_MARKERS.iter().any(|m| lower.contains(m))
                || code_match(&PRECONDITION_CODE, r"\b401\b"),
            environment: ENVIRONMENT_MARKERS.iter().any(|m| lower.contains(m))
                || code_match(&ENVIRONMENT_CODE, r"\b(403|429)\b"),
        }
    }

    /// 证据所支持的最低失败等级
    pub fn lowest(&self) -> Option<FailureLevel> {
        if self.transport {
            Some(FailureLevel::L1)
        } else if self.precondition {
            Some(FailureLevel::L2)
        } else if self.environment {
            Some(FailureLevel::L3)
        } else {
            None
        }
    }

    pub fn has(&self, level: FailureLevel) -> bool {
        match level {
            FailureLevel::L1 => self.transport,
            FailureLevel::L2 => self.precondition,
            FailureLevel::L3 => self.environment,
            _ => false,
        }
    }

    fn describe(&self) -> String {
        let mut found = Vec::new();
        if self.transport {
            found.push("transport/tool failure (L1)");
        }
        if self.precondition {
            found.push("authentication/session problem (L2)");
        }
        if self.environment {
            found.push("blocking or rate limiting (L3)");
        }
        if found.is_empty() {
            "none".to_string()
        } else {
            found.join(", ")
        }
    }
}

/// 对建议等级施加严格升级：L0 不能低于已有证据，L2/L3 必须有对应证据，L4 之前先排除低层，
/// L5 需要此前已有 `strategic_streak - 1` 个连续 L4+ 判定
pub fn enforce_escalation(
    proposed: FailureLevel,
    signals: &EvidenceSignals,
    prior_streak: usize,
    strategic_streak: usize,
) -> FailureLevel {
    match proposed {
        FailureLevel::L0 => signals.lowest().unwrap_or(FailureLevel::L0),
        FailureLevel::L1 => FailureLevel::L1,
        FailureLevel::L2 | FailureLevel::L3 => signals.lowest().unwrap_or(FailureLevel::L1),
        FailureLevel::L4 => signals.lowest().unwrap_or(FailureLevel::L4),
        FailureLevel::L5 => match signals.lowest() {
            Some(lower) => lower,
            None if prior_streak + 1 >= strategic_streak => FailureLevel::L5,
            None => FailureLevel::L4,
        },
    }
}

// ---------------------------------------------------------------------------
// 节点
// ---------------------------------------------------------------------------

pub struct Reflector {
    oracle: Arc<dyn DecisionOracle>,
    validator: Arc<dyn ResultValidator>,
    extractor: Arc<dyn FactExtractor>,
    timeout: Duration,
    strategic_streak: usize,
    recovery: RecoveryEngine,
}

impl Reflector {
    pub fn new(
        oracle: Arc<dyn DecisionOracle>,
        validator: Arc<dyn ResultValidator>,
        extractor: Arc<dyn FactExtractor>,
        timeout: Duration,
    ) -> Self {
        Self {
            oracle,
            validator,
            extractor,
            timeout,
            strategic_streak: 3,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn with_strategic_streak(mut self, streak: usize) -> Self {
        self.strategic_streak = streak.max(1);
        self
    }

    /// 对一次动作/结果给出判定；解析失败与传输失败都不会向上抛出
    pub async fn classify(
        &self,
        state: &SessionState,
        request: &ActionRequest,
        result: &ActionResult,
    ) -> Result<Verdict, AgentError> {
        if request.is_submission() {
            return Ok(submission_verdict(request, result));
        }

        let signals = EvidenceSignals::scan(result);
        let context = self.build_context(state, request, result, &signals);
        let tail = &state.transcript[state.transcript.len().saturating_sub(VIEW_TAIL)..];
        let view = TranscriptView::new(&state.objective, tail, context);

        let proposed = match invoke_with_timeout(
            self.oracle.as_ref(),
            OracleRole::Reflector,
            &view,
            self.timeout,
        )
        .await
        {
            Ok(reply) => match decode_verdict(&reply.text) {
                Some(v) => v,
                None => self.recover(AgentError::ParseError(preview(&reply.text)))?,
            },
            Err(e) => self.recover(e)?,
        };

        Ok(self.gate(proposed, state, result, &signals))
    }

    fn recover(&self, err: AgentError) -> Result<Verdict, AgentError> {
        match self.recovery.handle(&err) {
            RecoveryAction::RecordTransportFailure(msg) => {
                tracing::warn!("Evaluation oracle unavailable: {}", msg);
                Ok(Verdict::transport_failure(msg))
            }
            RecoveryAction::UseDefault(msg) | RecoveryAction::RejectAction(msg) => {
                tracing::warn!("Falling back to default verdict: {}", msg);
                Ok(Verdict::fallback(msg))
            }
            RecoveryAction::Abort => Err(err),
        }
    }

    fn gate(
        &self,
        mut verdict: Verdict,
        state: &SessionState,
        result: &ActionResult,
        signals: &EvidenceSignals,
    ) -> Verdict {
        if verdict.status == VerdictStatus::Verified {
            let confirmed = self
                .validator
                .candidates(&result.output)
                .iter()
                .any(|c| self.validator.verify(c));
            if confirmed {
                verdict.level = None;
                return verdict;
            }
            tracing::warn!("Oracle claimed success without a validated artifact; downgrading to PARTIAL");
            verdict.status = VerdictStatus::Partial;
            verdict.recommendations.push(
                "The claimed success was not confirmed by the result validator; submit the exact artifact with submit_result."
                    .to_string(),
            );
            verdict.level = Some(signals.lowest().unwrap_or(FailureLevel::L1));
            return verdict;
        }

        let prior_streak = state.failure_history.trailing_streak(FailureLevel::L4);
        let proposed = verdict.level.unwrap_or(FailureLevel::L1);
        let level = enforce_escalation(proposed, signals, prior_streak, self.strategic_streak);
        if level != proposed {
            tracing::info!(proposed = %proposed, enforced = %level, "failure level adjusted by escalation gate");
        }
        verdict.level = Some(level);
        verdict
    }

    fn build_context(
        &self,
        state: &SessionState,
        request: &ActionRequest,
        result: &ActionResult,
        signals: &EvidenceSignals,
    ) -> String {
        let mut s = format!(
            "## Last action #{}\n{} {}\n\n## Result (exit {:?}, timed out: {})\n{}\n\n## Signals\n",
            request.id,
            request.tool,
            request.args,
            result.exit_status,
            result.timed_out,
            preview_n(&result.output, RESULT_EXCERPT),
        );
        s.push_str(&format!("- evidence: {}\n", signals.describe()));
        s.push_str(&format!(
            "- repetition: {}\n",
            state.recent_requests.warning().unwrap_or_else(|| "none".to_string())
        ));
        s.push_str(&format!(
            "- confidence: {:.1}% ({:?})\n- consecutive failures: {}\n",
            state.confidence_score,
            state.confidence_tier(),
            state.consecutive_failures
        ));
        let history = state.failure_history.to_prompt_section();
        if !history.is_empty() {
            s.push('\n');
            s.push_str(&history);
        }
        s
    }

    pub async fn run(&self, state: &SessionState) -> Result<StateUpdate, AgentError> {
        let Some((request, result)) = last_exchange(&state.transcript) else {
            tracing::warn!("Reflector reached without a completed action; nothing to classify");
            return Ok(StateUpdate::default());
        };
        let verdict = self.classify(state, request, result).await?;
        tracing::info!(verdict = %verdict.summary_line(), "reflection");

        let mut update = StateUpdate::default();
        update.discoveries.extend(
            verdict
                .extracted_intelligence
                .iter()
                .map(|i| Discovery::new("intelligence", i.trim(), "reflector").with_confidence(70)),
        );

        if !request.is_submission() {
            match self.extractor.extract(&result.output, "reflector") {
                Ok(facts) => update.discoveries.extend(facts),
                Err(e) => tracing::warn!("Fact extraction failed in reflector: {}", e),
            }

            let fresh: Vec<String> = self
                .validator
                .candidates(&result.output)
                .into_iter()
                .filter(|c| !state.submitted_artifacts.contains(c))
                .collect();
            for (i, candidate) in fresh.iter().enumerate() {
                tracing::info!(candidate = %candidate, "queueing result submission");
                update.entries.push(TranscriptEntry::ActionRequest(ActionRequest::submission(
                    state.next_request_id() + i as u64,
                    candidate,
                )));
            }
            update.submitted = fresh;
        }

        update.verdict = Some(verdict);
        Ok(update)
    }
}

/// 提交结果由验证器决定，不需要预言机
fn submission_verdict(request: &ActionRequest, result: &ActionResult) -> Verdict {
    let artifact = request.submission_artifact().unwrap_or_default();
    if result.exit_status == Some(0) && result.output.starts_with("accepted") {
        Verdict {
            status: VerdictStatus::Verified,
            confidence: 1.0,
            level: None,
            root_cause: format!("{artifact} accepted by the result validator"),
            recommendations: Vec::new(),
            extracted_intelligence: Vec::new(),
        }
    } else {
        Verdict {
            status: VerdictStatus::Failed,
            confidence: 0.9,
            level: Some(FailureLevel::L4),
            root_cause: format!("{artifact} rejected by the result validator"),
            recommendations: vec![
                "The candidate is not the expected result; look for the real artifact elsewhere.".to_string(),
            ],
            extracted_intelligence: Vec::new(),
        }
    }
}

fn preview(text: &str) -> String {
    preview_n(text, 200)
}

fn preview_n(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Objective;
    use crate::react::oracle::{parse_oracle_output, OracleReply};
    use crate::tools::extractor::PatternExtractor;
    use crate::tools::validator::{ExpectedValueValidator, DEFAULT_ARTIFACT_PATTERN};
    use async_trait::async_trait;

    struct Fixed(String);

    #[async_trait]
    impl DecisionOracle for Fixed {
        async fn invoke(&self, _role: OracleRole, _view: &TranscriptView<'_>) -> Result<OracleReply, AgentError> {
            Ok(parse_oracle_output(&self.0))
        }
    }

    struct Down;

    #[async_trait]
    impl DecisionOracle for Down {
        async fn invoke(&self, _role: OracleRole, _view: &TranscriptView<'_>) -> Result<OracleReply, AgentError> {
            Err(AgentError::OracleUnavailable("502 bad gateway".into()))
        }
    }

    fn verdict_json(status: &str, level: &str) -> String {
        format!(
            r#"{{"audit_result": {{"status": "{status}", "confidence": 80, "reasoning": "r"}},
                "failure_analysis": {{"level": "{level}", "root_cause": "cause", "recommendations": ["next"]}},
                "intelligence": {{"key_findings": ["admin panel at /admin"], "attack_vectors": []}}}}"#
        )
    }

    fn reflector(oracle: Arc<dyn DecisionOracle>, expected: Option<&str>) -> Reflector {
        Reflector::new(
            oracle,
            Arc::new(ExpectedValueValidator::new(expected.map(String::from), DEFAULT_ARTIFACT_PATTERN).unwrap()),
            Arc::new(PatternExtractor::new().unwrap()),
            Duration::from_secs(5),
        )
    }

    fn state_with(output: &str, exit: i32) -> SessionState {
        let mut s = SessionState::new(Objective::new("http://t", "get the flag"), 10);
        s.apply(StateUpdate {
            entries: vec![
                TranscriptEntry::ActionRequest(ActionRequest::new(
                    1,
                    "execute_command",
                    serde_json::json!({"command": "curl http://t"}),
                )),
                TranscriptEntry::ActionResult(ActionResult {
                    request_id: 1,
                    output: output.to_string(),
                    exit_status: Some(exit),
                    timed_out: false,
                }),
            ],
            ..Default::default()
        });
        s
    }

    fn result(output: &str) -> ActionResult {
        ActionResult {
            request_id: 1,
            output: output.to_string(),
            exit_status: Some(0),
            timed_out: false,
        }
    }

    #[test]
    fn test_failure_level_parse_variants() {
        assert_eq!(FailureLevel::parse("L3"), Some(FailureLevel::L3));
        assert_eq!(FailureLevel::parse("3"), Some(FailureLevel::L3));
        assert_eq!(FailureLevel::parse("l2_precondition"), Some(FailureLevel::L2));
        assert_eq!(FailureLevel::parse("L9"), None);
        assert_eq!(FailureLevel::parse("high"), None);
    }

    #[test]
    fn test_decode_verdict_from_fenced_block() {
        let text = format!("Here is my audit:\n```json\n{}\n```", verdict_json("FAILED", "L3"));
        let v = decode_verdict(&text).unwrap();
        assert_eq!(v.status, VerdictStatus::Failed);
        assert_eq!(v.level, Some(FailureLevel::L3));
        assert!((v.confidence - 0.8).abs() < 1e-9);
        assert_eq!(v.root_cause, "cause");
        assert_eq!(v.extracted_intelligence, vec!["admin panel at /admin".to_string()]);
    }

    #[test]
    fn test_decode_verdict_rejects_garbage() {
        assert!(decode_verdict("the target looks vulnerable").is_none());
        assert!(decode_verdict("{}").is_none());
    }

    #[test]
    fn test_evidence_scan() {
        let s = EvidenceSignals::scan(&result("curl: (7) Failed to connect to t port 80: Connection refused"));
        assert_eq!(s.lowest(), Some(FailureLevel::L1));
        let s = EvidenceSignals::scan(&result("HTTP/1.1 401 Unauthorized"));
        assert_eq!(s.lowest(), Some(FailureLevel::L2));
        let s = EvidenceSignals::scan(&result("HTTP/1.1 429 Too Many Requests"));
        assert_eq!(s.lowest(), Some(FailureLevel::L3));
        let s = EvidenceSignals::scan(&result("Content-Length: 4031\n<html>welcome</html>"));
        assert_eq!(s.lowest(), None);
    }

    #[test]
    fn test_gate_without_evidence_never_emits_l2_or_l3() {
        let none = EvidenceSignals::default();
        assert_eq!(enforce_escalation(FailureLevel::L2, &none, 0, 3), FailureLevel::L1);
        assert_eq!(enforce_escalation(FailureLevel::L3, &none, 0, 3), FailureLevel::L1);
        assert_eq!(enforce_escalation(FailureLevel::L4, &none, 0, 3), FailureLevel::L4);
        assert_eq!(enforce_escalation(FailureLevel::L5, &none, 0, 3), FailureLevel::L4);
        assert_eq!(enforce_escalation(FailureLevel::L5, &none, 2, 3), FailureLevel::L5);
    }

    #[test]
    fn test_l0_is_floored_by_evidence() {
        let transport = EvidenceSignals {
            transport: true,
            ..Default::default()
        };
        assert_eq!(enforce_escalation(FailureLevel::L0, &transport, 0, 3), FailureLevel::L1);
        let none = EvidenceSignals::default();
        assert_eq!(enforce_escalation(FailureLevel::L0, &none, 0, 3), FailureLevel::L0);
    }

    #[test]
    fn test_local_rejection_is_tool_failure_not_blocking() {
        let rejected = ActionResult {
            request_id: 1,
            output: format!("{REJECTION_PREFIX}command contains forbidden pattern 'mkfs'"),
            exit_status: None,
            timed_out: false,
        };
        let s = EvidenceSignals::scan(&rejected);
        assert!(!s.environment);
        assert_eq!(s.lowest(), Some(FailureLevel::L1));
        let s = EvidenceSignals::scan(&result("HTTP/1.1 403 Forbidden"));
        assert_eq!(s.lowest(), Some(FailureLevel::L3));
    }

    #[test]
    fn test_gate_strict_escalation_over_random_signals() {
        let mut seed: u64 = 0xdead_beef;
        let mut next = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            seed >> 33
        };
        let levels = [
            FailureLevel::L0,
            FailureLevel::L1,
            FailureLevel::L2,
            FailureLevel::L3,
            FailureLevel::L4,
            FailureLevel::L5,
        ];
        for _ in 0..2000 {
            let signals = EvidenceSignals {
                transport: next() % 2 == 0,
                precondition: next() % 2 == 0,
                environment: next() % 2 == 0,
            };
            let proposed = levels[(next() % 6) as usize];
            let streak = (next() % 5) as usize;
            let level = enforce_escalation(proposed, &signals, streak, 3);
            if level == FailureLevel::L2 {
                assert!(signals.precondition && !signals.transport);
            }
            if level == FailureLevel::L3 {
                assert!(signals.environment && !signals.transport && !signals.precondition);
            }
            if level >= FailureLevel::L4 {
                assert!(signals.lowest().is_none());
            }
            if level == FailureLevel::L5 {
                assert!(streak + 1 >= 3);
            }
        }
    }

    #[test]
    fn test_failure_history_ring_and_streak() {
        let mut h = FailureHistory::new(3);
        for level in [FailureLevel::L1, FailureLevel::L4, FailureLevel::L4, FailureLevel::L5] {
            let mut v = Verdict::fallback("x");
            v.level = Some(level);
            h.push(v);
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.trailing_streak(FailureLevel::L4), 3);
        let mut ok = Verdict::fallback("y");
        ok.level = Some(FailureLevel::L0);
        h.push(ok);
        assert_eq!(h.trailing_streak(FailureLevel::L4), 0);
    }

    #[tokio::test]
    async fn test_parse_failure_defaults_to_l1() {
        let r = reflector(Arc::new(Fixed("I think it worked".into())), None);
        let state = state_with("<html>ok</html>", 0);
        let update = r.run(&state).await.unwrap();
        let v = update.verdict.unwrap();
        assert_eq!(v.status, VerdictStatus::Failed);
        assert_eq!(v.level, Some(FailureLevel::L1));
        assert_eq!(v.confidence, 0.5);
    }

    #[tokio::test]
    async fn test_transport_failure_is_l1() {
        let r = reflector(Arc::new(Down), None);
        let state = state_with("<html>ok</html>", 0);
        let v = r.run(&state).await.unwrap().verdict.unwrap();
        assert_eq!(v.level, Some(FailureLevel::L1));
        assert!(v.root_cause.contains("502"));
    }

    #[tokio::test]
    async fn test_timed_out_result_is_never_l0() {
        let r = reflector(Arc::new(Fixed(verdict_json("FAILED", "L0"))), None);
        let mut state = state_with("", 0);
        if let Some(TranscriptEntry::ActionResult(res)) = state.transcript.last_mut() {
            res.exit_status = None;
            res.timed_out = true;
        }
        let v = r.run(&state).await.unwrap().verdict.unwrap();
        assert_eq!(v.level, Some(FailureLevel::L1));
    }

    #[tokio::test]
    async fn test_claimed_success_without_validation_is_partial() {
        let r = reflector(Arc::new(Fixed(verdict_json("VERIFIED", "L0"))), Some("flag{real}"));
        let state = state_with("Login successful! flag{fake}", 0);
        let update = r.run(&state).await.unwrap();
        let v = update.verdict.unwrap();
        assert_eq!(v.status, VerdictStatus::Partial);
        assert_eq!(v.level, Some(FailureLevel::L1));
        assert_eq!(update.submitted, vec!["flag{fake}".to_string()]);
        assert!(matches!(
            &update.entries[0],
            TranscriptEntry::ActionRequest(req) if req.is_submission() && req.id == 2
        ));
    }

    #[tokio::test]
    async fn test_intelligence_becomes_discoveries() {
        let r = reflector(Arc::new(Fixed(verdict_json("FAILED", "L4"))), None);
        let state = state_with("Server: nginx/1.18.0\n\nnothing here", 0);
        let update = r.run(&state).await.unwrap();
        assert_eq!(update.verdict.unwrap().level, Some(FailureLevel::L4));
        assert!(update
            .discoveries
            .iter()
            .any(|d| d.category == "intelligence" && d.content == "admin panel at /admin"));
        assert!(update.discoveries.iter().any(|d| d.category == "technology"));
    }

    #[tokio::test]
    async fn test_oracle_l3_without_block_evidence_is_downgraded() {
        let r = reflector(Arc::new(Fixed(verdict_json("FAILED", "L3"))), None);
        let state = state_with("<html>plain page</html>", 0);
        let v = r.run(&state).await.unwrap().verdict.unwrap();
        assert_eq!(v.level, Some(FailureLevel::L1));
    }

    #[tokio::test]
    async fn test_submission_is_classified_without_oracle() {
        let r = reflector(Arc::new(Down), Some("flag{x}"));
        let mut state = SessionState::new(Objective::new("t", "g"), 10);
        state.apply(StateUpdate {
            entries: vec![
                TranscriptEntry::ActionRequest(ActionRequest::submission(1, "flag{y}")),
                TranscriptEntry::ActionResult(ActionResult {
                    request_id: 1,
                    output: "rejected: flag{y}".into(),
                    exit_status: Some(1),
                    timed_out: false,
                }),
            ],
            ..Default::default()
        });
        let update = r.run(&state).await.unwrap();
        let v = update.verdict.unwrap();
        assert_eq!(v.level, Some(FailureLevel::L4));
        assert!(update.entries.is_empty());
    }

    #[test]
    fn test_schema_mentions_sections() {
        let schema = verdict_schema();
        assert!(schema.contains("audit_result"));
        assert!(schema.contains("failure_analysis"));
    }
}
