//! 运行报告：任何退出路径都写出 discoveries 与失败历史（未完成运行的残值）

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::orchestrator::RunOutcome;
use crate::core::session::SessionContext;
use crate::core::state::{Objective, RunStatus};
use crate::core::AgentError;
use crate::memory::discoveries::Discovery;
use crate::memory::working::ActionHistory;
use crate::react::oracle::{OracleRole, TokenCount};
use crate::react::reflector::FailureHistory;

#[derive(Debug, Serialize)]
struct RunReport<'a> {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    objective: &'a Objective,
    status: RunStatus,
    reason: &'a str,
    result: Option<&'a str>,
    steps: u32,
    attempts: u32,
    confidence: f64,
    token_usage: &'a BTreeMap<OracleRole, TokenCount>,
    tokens_total: TokenCount,
    discoveries: &'a [Discovery],
    failure_history: &'a FailureHistory,
    action_history: &'a ActionHistory,
}

/// 写出 `<dir>/<run_id>.json`，返回文件路径
pub fn write_report(dir: &Path, ctx: &SessionContext, outcome: &RunOutcome) -> Result<PathBuf, AgentError> {
    std::fs::create_dir_all(dir)?;
    let report = RunReport {
        run_id: ctx.run_id.to_string(),
        started_at: ctx.started_at,
        finished_at: Utc::now(),
        objective: &ctx.state.objective,
        status: outcome.status,
        reason: &outcome.reason,
        result: outcome.result.as_deref(),
        steps: outcome.steps,
        attempts: outcome.attempts,
        confidence: ctx.state.confidence_score,
        token_usage: &outcome.token_usage,
        tokens_total: outcome.total_tokens(),
        discoveries: ctx.state.discoveries.items(),
        failure_history: &ctx.state.failure_history,
        action_history: &ctx.state.action_history,
    };
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| AgentError::InvalidState(format!("report serialization: {e}")))?;
    let path = dir.join(format!("{}.json", ctx.run_id));
    std::fs::write(&path, json)?;
    tracing::info!(path = %path.display(), "run report written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::core::session::new_session;

    #[test]
    fn test_report_contains_salvage() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = new_session(Objective::new("http://t", "g"), &AppConfig::default());
        ctx.state.discoveries.add(Discovery::new("api_endpoint", "/api/users", "test"));
        let outcome = RunOutcome {
            status: RunStatus::Exhausted,
            reason: "budget exhausted: attempts".into(),
            result: None,
            steps: 7,
            attempts: 3,
            token_usage: BTreeMap::from([
                (OracleRole::Planner, TokenCount::from((100, 20, 120))),
                (OracleRole::Reflector, TokenCount::from((50, 10, 60))),
            ]),
        };
        let path = write_report(dir.path(), &ctx, &outcome).unwrap();
        let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(v["status"], "exhausted");
        assert_eq!(v["discoveries"][0]["content"], "/api/users");
        assert_eq!(v["attempts"], 3);
        assert!(v["failure_history"]["entries"].is_array());
        assert_eq!(v["token_usage"]["planner"]["total"], 120);
        assert_eq!(v["tokens_total"]["total"], 180);
    }
}
