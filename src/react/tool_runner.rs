//! ToolRunner：执行最早一个未完成的动作请求
//!
//! submit_result 交给 ResultValidator，其余交给沙箱。沙箱错误经 RecoveryEngine 转为结果文本
//! （传输类标记为超时 / 失败，拒绝类反馈给模型），只有 Abort 类错误向上抛出。
//! 每次执行计入一次尝试，并更新置信度、连续失败数、重复检测记录与动作历史。

use std::sync::Arc;
use std::time::Duration;

use crate::core::state::{RunStatus, SessionState, StateUpdate, Termination};
use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::memory::transcript::{pending_request, ActionRequest, ActionResult, TranscriptEntry};
use crate::memory::working::ActionRecord;
use crate::react::oracle::DecisionOracle;
use crate::signals::confidence::{ConfidenceAssessor, Outcome};
use crate::signals::repetition::{
    extract_request_params, ErrorCategory, RequestFingerprint, RequestRecord, ResponseSignature,
};
use crate::tools::executor::ToolExecutor;
use crate::tools::extractor::FactExtractor;
use crate::tools::validator::ResultValidator;

pub struct ToolRunner {
    executor: ToolExecutor,
    validator: Arc<dyn ResultValidator>,
    extractor: Arc<dyn FactExtractor>,
    assessor: ConfidenceAssessor,
    /// 设置后用评估预言机判定单步结果
    confidence_oracle: Option<(Arc<dyn DecisionOracle>, Duration)>,
    output_limit: usize,
    recovery: RecoveryEngine,
}

impl ToolRunner {
    pub fn new(
        executor: ToolExecutor,
        validator: Arc<dyn ResultValidator>,
        extractor: Arc<dyn FactExtractor>,
        assessor: ConfidenceAssessor,
    ) -> Self {
        Self {
            executor,
            validator,
            extractor,
            assessor,
            confidence_oracle: None,
            output_limit: 5000,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit.max(200);
        self
    }

    pub fn with_confidence_oracle(mut self, oracle: Arc<dyn DecisionOracle>, timeout: Duration) -> Self {
        self.confidence_oracle = Some((oracle, timeout));
        self
    }

    pub async fn run(&self, state: &SessionState) -> Result<StateUpdate, AgentError> {
        let request = pending_request(&state.transcript)
            .ok_or_else(|| AgentError::InvalidState("tool runner reached without a pending action".into()))?;

        if request.is_submission() {
            return Ok(self.submit(request));
        }

        let result = match self.executor.execute(request).await {
            Ok(out) => ActionResult {
                request_id: request.id,
                output: condense(&out.stdout, self.output_limit),
                exit_status: out.exit_status,
                timed_out: false,
            },
            Err(e) => match self.recovery.handle(&e) {
                RecoveryAction::RecordTransportFailure(msg) => ActionResult {
                    request_id: request.id,
                    output: msg,
                    exit_status: None,
                    timed_out: matches!(e, AgentError::SandboxTimeout(_)),
                },
                RecoveryAction::RejectAction(msg) | RecoveryAction::UseDefault(msg) => ActionResult {
                    request_id: request.id,
                    output: msg,
                    exit_status: None,
                    timed_out: false,
                },
                RecoveryAction::Abort => return Err(e),
            },
        };

        let (score, trace) = match &self.confidence_oracle {
            Some((oracle, timeout)) => {
                self.assessor
                    .update_with_oracle(oracle.as_ref(), &state.objective, state.confidence_score, &result.output, *timeout)
                    .await
            }
            None => self.assessor.update(state.confidence_score, &result.output),
        };
        let outcome = if result.timed_out || result.exit_status.is_none() {
            Outcome::Failure
        } else {
            self.assessor.classify(&result.output)
        };
        let failed = outcome == Outcome::Failure;
        tracing::info!(
            id = request.id,
            exit = ?result.exit_status,
            confidence = %trace,
            "observation recorded"
        );

        let fingerprint = request
            .payload()
            .and_then(extract_request_params)
            .unwrap_or_else(|| RequestFingerprint::from_json(&request.args));
        let record = RequestRecord {
            fingerprint,
            signature: ResponseSignature::from_output(&result.output),
            error: ErrorCategory::detect(&result.output),
        };

        let discoveries = match self.extractor.extract(&result.output, &request.tool) {
            Ok(facts) => facts,
            Err(e) => {
                tracing::warn!("Fact extraction failed for action #{}: {}", request.id, e);
                Vec::new()
            }
        };

        let action_record = ActionRecord {
            attempt: state.attempt_count + 1,
            tool: request.tool.clone(),
            succeeded: !failed,
            summary: summarize(request, &result),
        };

        Ok(StateUpdate {
            entries: vec![TranscriptEntry::ActionResult(result)],
            count_attempt: true,
            consecutive_failures: Some(if failed { state.consecutive_failures + 1 } else { 0 }),
            confidence: Some((score, trace)),
            discoveries,
            action_record: Some(action_record),
            request_record: Some(record),
            ..Default::default()
        })
    }

    /// 提交候选结果：只有验证器可以确认
    fn submit(&self, request: &ActionRequest) -> StateUpdate {
        let artifact = request.submission_artifact().unwrap_or_default().trim().to_string();
        let accepted = !artifact.is_empty() && self.validator.verify(&artifact);
        let output = if accepted {
            format!("accepted: {artifact}")
        } else {
            format!("rejected: {artifact}")
        };
        tracing::info!(artifact = %artifact, accepted, "result submitted");

        let mut update = StateUpdate {
            entries: vec![TranscriptEntry::ActionResult(ActionResult {
                request_id: request.id,
                output,
                exit_status: Some(if accepted { 0 } else { 1 }),
                timed_out: false,
            })],
            count_attempt: true,
            submitted: vec![artifact.clone()],
            ..Default::default()
        };
        if accepted {
            update.result = Some(artifact);
            update.termination = Some(Termination {
                status: RunStatus::Verified,
                reason: "result accepted by validator".to_string(),
            });
        }
        update
    }
}

/// 超长输出保留头尾
pub fn condense(output: &str, limit: usize) -> String {
    let total = output.chars().count();
    if total <= limit {
        return output.to_string();
    }
    let head_len = limit * 2 / 3;
    let tail_len = limit - head_len;
    let head: String = output.chars().take(head_len).collect();
    let tail: String = output.chars().skip(total - tail_len).collect();
    format!(
        "{head}\n... [{} chars omitted] ...\n{tail}",
        total - head_len - tail_len
    )
}

fn summarize(request: &ActionRequest, result: &ActionResult) -> String {
    let what: String = request
        .payload()
        .map(str::to_string)
        .unwrap_or_else(|| request.args.to_string())
        .chars()
        .take(80)
        .collect();
    let first_line: String = result
        .output
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("(no output)")
        .chars()
        .take(80)
        .collect();
    format!("{what} -> {first_line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::Objective;
    use crate::tools::extractor::PatternExtractor;
    use crate::tools::sandbox::{ExecutionSandbox, SandboxOutput};
    use crate::tools::validator::{ExpectedValueValidator, DEFAULT_ARTIFACT_PATTERN};
    use async_trait::async_trait;

    struct Canned(Result<SandboxOutput, fn() -> AgentError>);

    #[async_trait]
    impl ExecutionSandbox for Canned {
        async fn run(&self, _request: &ActionRequest, _timeout: Duration) -> Result<SandboxOutput, AgentError> {
            match &self.0 {
                Ok(out) => Ok(out.clone()),
                Err(make) => Err(make()),
            }
        }
    }

    fn runner(sandbox: Canned) -> ToolRunner {
        ToolRunner::new(
            ToolExecutor::new(Arc::new(sandbox), 5),
            Arc::new(ExpectedValueValidator::new(Some("flag{real}".into()), DEFAULT_ARTIFACT_PATTERN).unwrap()),
            Arc::new(PatternExtractor::new().unwrap()),
            ConfidenceAssessor::default(),
        )
    }

    fn state_with(request: ActionRequest) -> SessionState {
        let mut s = SessionState::new(Objective::new("http://t", "get the flag"), 10);
        s.apply(StateUpdate {
            entries: vec![TranscriptEntry::ActionRequest(request)],
            ..Default::default()
        });
        s
    }

    fn command(cmd: &str) -> ActionRequest {
        ActionRequest::new(1, "execute_command", serde_json::json!({ "command": cmd }))
    }

    #[tokio::test]
    async fn test_successful_command_resets_failures() {
        let r = runner(Canned(Ok(SandboxOutput {
            stdout: "HTTP/1.1 200 OK\nServer: nginx".into(),
            exit_status: Some(0),
        })));
        let mut s = state_with(command("curl -i http://t"));
        s.consecutive_failures = 2;
        let update = r.run(&s).await.unwrap();
        assert!(update.count_attempt);
        assert_eq!(update.consecutive_failures, Some(0));
        assert_eq!(update.confidence.unwrap().0, 70.0);
        assert!(update.action_record.unwrap().succeeded);
        assert!(update.request_record.is_some());
    }

    #[tokio::test]
    async fn test_sandbox_timeout_becomes_failed_result() {
        let r = runner(Canned(Err(|| AgentError::SandboxTimeout(5))));
        let s = state_with(command("sleep 100"));
        let update = r.run(&s).await.unwrap();
        match &update.entries[0] {
            TranscriptEntry::ActionResult(res) => {
                assert!(res.timed_out);
                assert_eq!(res.request_id, 1);
            }
            other => panic!("expected result, got {other:?}"),
        }
        assert_eq!(update.consecutive_failures, Some(1));
    }

    #[tokio::test]
    async fn test_forbidden_command_is_fed_back() {
        let r = runner(Canned(Err(|| AgentError::ForbiddenCommand("mkfs".into()))));
        let update = r.run(&state_with(command("mkfs /dev/sda"))).await.unwrap();
        match &update.entries[0] {
            TranscriptEntry::ActionResult(res) => assert!(res.output.contains("forbidden pattern")),
            other => panic!("expected result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_abort_class_error_propagates() {
        let r = runner(Canned(Err(|| AgentError::NodePanicked("boom".into()))));
        assert!(r.run(&state_with(command("id"))).await.is_err());
    }

    #[tokio::test]
    async fn test_accepted_submission_terminates_verified() {
        let r = runner(Canned(Err(|| AgentError::InvalidState("sandbox must not be used".into()))));
        let update = r.run(&state_with(ActionRequest::submission(1, "FLAG{real}"))).await.unwrap();
        assert_eq!(update.result.as_deref(), Some("FLAG{real}"));
        assert_eq!(update.termination.unwrap().status, RunStatus::Verified);
        assert!(update.count_attempt);
    }

    #[tokio::test]
    async fn test_rejected_submission_does_not_terminate() {
        let r = runner(Canned(Err(|| AgentError::InvalidState("unused".into()))));
        let update = r.run(&state_with(ActionRequest::submission(1, "flag{nope}"))).await.unwrap();
        assert!(update.result.is_none());
        assert!(update.termination.is_none());
        assert_eq!(update.submitted, vec!["flag{nope}".to_string()]);
    }

    #[tokio::test]
    async fn test_without_pending_request_is_invalid_state() {
        let r = runner(Canned(Err(|| AgentError::InvalidState("unused".into()))));
        let s = SessionState::new(Objective::new("t", "g"), 10);
        assert!(matches!(r.run(&s).await, Err(AgentError::InvalidState(_))));
    }

    #[test]
    fn test_condense_keeps_head_and_tail() {
        let long = format!("{}{}", "a".repeat(6000), "END");
        let out = condense(&long, 300);
        assert!(out.starts_with("aaaa"));
        assert!(out.ends_with("END"));
        assert!(out.contains("chars omitted"));
        assert_eq!(condense("short", 300), "short");
    }
}
