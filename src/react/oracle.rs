//! 决策预言机：单次语言模型调用的抽象边界
//!
//! invoke(role, view) 返回自由文本以及可选的结构化动作。JSON 解码在这里完成且可失败：
//! 解析不出动作时 action 为 None，核心逻辑从不假设输出格式良好。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use crate::core::state::Objective;
use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::memory::transcript::TranscriptEntry;
use crate::react::prompts::PromptSet;

/// 预言机角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleRole {
    Planner,
    Executor,
    Reflector,
    Assessor,
}

/// 传给预言机的只读视图：目标、转写以及节点拼好的上下文块
#[derive(Debug, Clone)]
pub struct TranscriptView<'a> {
    pub objective: &'a Objective,
    pub entries: &'a [TranscriptEntry],
    pub context: String,
}

impl<'a> TranscriptView<'a> {
    pub fn new(objective: &'a Objective, entries: &'a [TranscriptEntry], context: String) -> Self {
        Self {
            objective,
            entries,
            context,
        }
    }
}

/// 模型给出的动作（简化 JSON：{"tool": "execute_command", "args": {"command": "..."}}）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDraft {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleReply {
    pub text: String,
    pub action: Option<ActionDraft>,
}

/// 累计 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenCount {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenCount {
    pub fn add(self, other: TokenCount) -> TokenCount {
        TokenCount {
            prompt: self.prompt + other.prompt,
            completion: self.completion + other.completion,
            total: self.total + other.total,
        }
    }
}

impl From<(u64, u64, u64)> for TokenCount {
    fn from((prompt, completion, total): (u64, u64, u64)) -> Self {
        Self {
            prompt,
            completion,
            total,
        }
    }
}

#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn invoke(
        &self,
        role: OracleRole,
        view: &TranscriptView<'_>,
    ) -> Result<OracleReply, AgentError>;

    /// 累计 token 用量；不基于 LLM 的实现返回 None
    fn token_usage(&self) -> Option<TokenCount> {
        None
    }
}

/// 带超时的调用；超时转为 OracleTimeout（传输类，按 L1 处理）
pub async fn invoke_with_timeout(
    oracle: &dyn DecisionOracle,
    role: OracleRole,
    view: &TranscriptView<'_>,
    limit: Duration,
) -> Result<OracleReply, AgentError> {
    match timeout(limit, oracle.invoke(role, view)).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::OracleTimeout(limit.as_secs())),
    }
}

/// 从文本中定位 JSON 块：```json 代码块，或第一个 `{` 到最后一个 `}`
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            let block = rest[..end].trim();
            if block.starts_with('{') {
                return Some(block);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 解析模型输出：含合法 JSON 且 tool 非空则为动作，否则只有文本
pub fn parse_oracle_output(output: &str) -> OracleReply {
    let text = output.trim().to_string();
    let action = extract_json_block(output)
        .and_then(|json| serde_json::from_str::<ActionDraft>(json).ok())
        .filter(|draft| !draft.tool.trim().is_empty());
    if action.is_none() && text.contains('{') {
        tracing::debug!("oracle output contains braces but no decodable action");
    }
    OracleReply { text, action }
}

/// 基于 LlmClient 的预言机实现：按角色拼 system prompt，把转写映射为对话消息
pub struct LlmOracle {
    llm: Arc<dyn LlmClient>,
    prompts: PromptSet,
}

impl LlmOracle {
    pub fn new(llm: Arc<dyn LlmClient>, prompts: PromptSet) -> Self {
        Self { llm, prompts }
    }

    pub fn build_messages(&self, role: OracleRole, view: &TranscriptView<'_>) -> Vec<Message> {
        let mut messages = vec![
            Message::system(self.prompts.for_role(role).to_string()),
            Message::user(view.objective.to_prompt_section()),
        ];
        for entry in view.entries {
            messages.push(match entry {
                TranscriptEntry::ActionRequest(req) => Message::assistant(
                    serde_json::json!({ "tool": req.tool, "args": req.args }).to_string(),
                ),
                TranscriptEntry::ExecutorNote { text } => Message::assistant(text.clone()),
                TranscriptEntry::ActionResult(res) => Message::user(format!(
                    "Observation for action #{}:\n{}",
                    res.request_id, res.output
                )),
                other => Message::user(other.render()),
            });
        }
        if !view.context.trim().is_empty() {
            messages.push(Message::user(view.context.clone()));
        }
        messages
    }
}

#[async_trait]
impl DecisionOracle for LlmOracle {
    async fn invoke(
        &self,
        role: OracleRole,
        view: &TranscriptView<'_>,
    ) -> Result<OracleReply, AgentError> {
        let messages = self.build_messages(role, view);
        tracing::debug!(role = ?role, messages = messages.len(), "oracle invoke");
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(|e| AgentError::OracleUnavailable(e.to_string()))?;
        Ok(parse_oracle_output(&output))
    }

    fn token_usage(&self) -> Option<TokenCount> {
        Some(self.llm.token_usage().into())
    }
}
