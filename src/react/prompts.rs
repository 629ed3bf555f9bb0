//! 各角色的指令文本
//!
//! 优先读取 config/prompts/<role>.md（或配置的目录），找不到时使用内置默认值。

use std::path::{Path, PathBuf};

use crate::react::oracle::OracleRole;
use crate::react::reflector::verdict_schema;

const DEFAULT_PLANNER: &str = "You are the planning role of an authorized penetration-testing loop. \
Read the objective, the discoveries, the failure history and the recent transcript, then write concise \
guidance for the executor: the most promising hypothesis, the next two or three concrete steps, and what \
to stop doing. Do not emit tool calls yourself.";

const DEFAULT_EXECUTOR: &str = "You are the executing role of an authorized penetration-testing loop. \
Follow the planner guidance. To act, reply with exactly one JSON object: \
{\"tool\": \"execute_command\", \"args\": {\"command\": \"...\"}} for a shell command, \
{\"tool\": \"execute_python\", \"args\": {\"code\": \"...\"}} for a python script, or \
{\"tool\": \"submit_result\", \"args\": {\"artifact\": \"...\"}} to submit a candidate result. \
If you are stuck and need the planner, write [REQUEST_GUIDANCE] in plain text instead.";

const DEFAULT_REFLECTOR: &str = "You are the evaluating role of an authorized penetration-testing loop. \
Audit the last action and its result. Never accept a claim of success that is not backed by the raw output. \
Classify failures with strict escalation, always ruling out lower levels first:\n\
L0 raw observation, nothing failed yet\n\
L1 tool or transport failure (timeouts, syntax errors, missing tools, unreachable host)\n\
L2 precondition failure (authentication, session, token, CSRF)\n\
L3 environment interference (WAF, rate limiting, blocking, filtering)\n\
L4 hypothesis falsified (the approach ran correctly and the target is not vulnerable to it)\n\
L5 strategic failure (several hypotheses falsified, the overall strategy is wrong)\n\
Status is VERIFIED, FAILED or PARTIAL. Extract every useful finding into intelligence.";

const DEFAULT_ASSESSOR: &str = "Classify the outcome of the last step. Reply with a single JSON object \
{\"outcome\": \"success\"} or {\"outcome\": \"failure\"} or {\"outcome\": \"ambiguous\"}.";

/// 四个角色的指令
#[derive(Debug, Clone)]
pub struct PromptSet {
    pub planner: String,
    pub executor: String,
    pub reflector: String,
    pub assessor: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            planner: DEFAULT_PLANNER.to_string(),
            executor: DEFAULT_EXECUTOR.to_string(),
            reflector: with_schema(DEFAULT_REFLECTOR),
            assessor: DEFAULT_ASSESSOR.to_string(),
        }
    }
}

fn with_schema(base: &str) -> String {
    format!(
        "{base}\n\nRespond with one JSON object matching this schema:\n{}",
        verdict_schema()
    )
}

impl PromptSet {
    /// 从目录加载；未指定目录时依次尝试 config/prompts 与 ../config/prompts
    pub fn load(dir: Option<&Path>) -> Self {
        let dirs: Vec<PathBuf> = match dir {
            Some(d) => vec![d.to_path_buf()],
            None => vec![PathBuf::from("config/prompts"), PathBuf::from("../config/prompts")],
        };
        let read = |name: &str| -> Option<String> {
            dirs.iter()
                .map(|d| d.join(format!("{name}.md")))
                .find_map(|p| std::fs::read_to_string(p).ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let defaults = Self::default();
        Self {
            planner: read("planner").unwrap_or(defaults.planner),
            executor: read("executor").unwrap_or(defaults.executor),
            reflector: read("reflector")
                .map(|s| with_schema(&s))
                .unwrap_or(defaults.reflector),
            assessor: read("assessor").unwrap_or(defaults.assessor),
        }
    }

    pub fn for_role(&self, role: OracleRole) -> &str {
        match role {
            OracleRole::Planner => &self.planner,
            OracleRole::Executor => &self.executor,
            OracleRole::Reflector => &self.reflector,
            OracleRole::Assessor => &self.assessor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reflector_prompt_embeds_schema() {
        let prompts = PromptSet::default();
        assert!(prompts.for_role(OracleRole::Reflector).contains("audit_result"));
        assert!(prompts.for_role(OracleRole::Executor).contains("[REQUEST_GUIDANCE]"));
    }

    #[test]
    fn test_load_overrides_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("planner.md"), "custom planner").unwrap();
        let prompts = PromptSet::load(Some(dir.path()));
        assert_eq!(prompts.planner, "custom planner");
        assert_eq!(prompts.executor, PromptSet::default().executor);
    }
}
