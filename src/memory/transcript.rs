//! 会话转写：带类型标签的条目序列
//!
//! 每个 ActionRequest 至多对应一个 ActionResult（按 request_id 配对）；压缩器必须整体保留或整体丢弃一对。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::react::reflector::Verdict;

/// 提交候选结果的内置工具名，由 ToolRunner 交给 ResultValidator 处理，不进入沙箱
pub const SUBMIT_TOOL: &str = "submit_result";

/// 执行者发出的结构化动作请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: u64,
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ActionRequest {
    pub fn new(id: u64, tool: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            id,
            tool: tool.into(),
            args,
        }
    }

    /// 构造一次结果提交请求
    pub fn submission(id: u64, artifact: &str) -> Self {
        Self::new(id, SUBMIT_TOOL, serde_json::json!({ "artifact": artifact }))
    }

    pub fn is_submission(&self) -> bool {
        self.tool == SUBMIT_TOOL
    }

    pub fn submission_artifact(&self) -> Option<&str> {
        self.args.get("artifact").and_then(|v| v.as_str())
    }

    /// 命令正文：shell 命令或 python 代码
    pub fn payload(&self) -> Option<&str> {
        self.args
            .get("command")
            .or_else(|| self.args.get("code"))
            .and_then(|v| v.as_str())
    }
}

/// 沙箱（或验证器）对某个请求的回应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub request_id: u64,
    pub output: String,
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
}

/// 转写条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEntry {
    /// Planner 给出的指导
    PlannerNote { text: String },
    /// Executor 的自由文本决策（没有结构化动作）
    ExecutorNote { text: String },
    ActionRequest(ActionRequest),
    ActionResult(ActionResult),
    /// Reflector 的判定
    Verdict(Verdict),
    /// 压缩后替代头部的上下文摘要
    Summary { text: String },
}

impl TranscriptEntry {
    /// 条目的纯文本表示（用于事实抽取、摘要与字节统计）
    pub fn render(&self) -> String {
        match self {
            TranscriptEntry::PlannerNote { text } => format!("[planner] {text}"),
            TranscriptEntry::ExecutorNote { text } => format!("[executor] {text}"),
            TranscriptEntry::ActionRequest(req) => {
                format!("[action #{}] {} {}", req.id, req.tool, req.args)
            }
            TranscriptEntry::ActionResult(res) => {
                let status = match (res.timed_out, res.exit_status) {
                    (true, _) => "timeout".to_string(),
                    (false, Some(code)) => format!("exit {code}"),
                    (false, None) => "no exit status".to_string(),
                };
                format!("[result #{} {}] {}", res.request_id, status, res.output)
            }
            TranscriptEntry::Verdict(v) => format!("[verdict] {}", v.summary_line()),
            TranscriptEntry::Summary { text } => format!("[summary] {text}"),
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            TranscriptEntry::PlannerNote { text }
            | TranscriptEntry::ExecutorNote { text }
            | TranscriptEntry::Summary { text } => text.len(),
            TranscriptEntry::ActionRequest(req) => req.tool.len() + req.args.to_string().len(),
            TranscriptEntry::ActionResult(res) => res.output.len(),
            TranscriptEntry::Verdict(v) => v.summary_line().len(),
        }
    }
}

pub fn total_bytes(entries: &[TranscriptEntry]) -> usize {
    entries.iter().map(TranscriptEntry::byte_len).sum()
}

fn answered_ids(entries: &[TranscriptEntry]) -> HashSet<u64> {
    entries
        .iter()
        .filter_map(|e| match e {
            TranscriptEntry::ActionResult(res) => Some(res.request_id),
            _ => None,
        })
        .collect()
}

/// 最早一个尚未得到结果的请求
pub fn pending_request(entries: &[TranscriptEntry]) -> Option<&ActionRequest> {
    let answered = answered_ids(entries);
    entries.iter().find_map(|e| match e {
        TranscriptEntry::ActionRequest(req) if !answered.contains(&req.id) => Some(req),
        _ => None,
    })
}

/// 最近一次完整的请求/结果对
pub fn last_exchange(entries: &[TranscriptEntry]) -> Option<(&ActionRequest, &ActionResult)> {
    let result = entries.iter().rev().find_map(|e| match e {
        TranscriptEntry::ActionResult(res) => Some(res),
        _ => None,
    })?;
    let request = entries.iter().rev().find_map(|e| match e {
        TranscriptEntry::ActionRequest(req) if req.id == result.request_id => Some(req),
        _ => None,
    })?;
    Some((request, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: u64) -> TranscriptEntry {
        TranscriptEntry::ActionRequest(ActionRequest::new(
            id,
            "execute_command",
            serde_json::json!({ "command": format!("curl http://t/{id}") }),
        ))
    }

    fn res(id: u64, out: &str) -> TranscriptEntry {
        TranscriptEntry::ActionResult(ActionResult {
            request_id: id,
            output: out.to_string(),
            exit_status: Some(0),
            timed_out: false,
        })
    }

    #[test]
    fn test_pending_request_is_oldest_unanswered() {
        let entries = vec![req(1), res(1, "ok"), req(2), req(3)];
        assert_eq!(pending_request(&entries).map(|r| r.id), Some(2));
        let answered = vec![req(1), res(1, "ok")];
        assert!(pending_request(&answered).is_none());
    }

    #[test]
    fn test_last_exchange_pairs_by_id() {
        let entries = vec![req(1), res(1, "first"), req(2), res(2, "second"), req(3)];
        let (r, o) = last_exchange(&entries).unwrap();
        assert_eq!(r.id, 2);
        assert_eq!(o.output, "second");
    }

    #[test]
    fn test_submission_helpers() {
        let r = ActionRequest::submission(7, "flag{x}");
        assert!(r.is_submission());
        assert_eq!(r.submission_artifact(), Some("flag{x}"));
        assert_eq!(r.payload(), None);
    }

    #[test]
    fn test_entry_serializes_with_kind_tag() {
        let json = serde_json::to_value(TranscriptEntry::PlannerNote {
            text: "enumerate".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "planner_note");
        assert_eq!(total_bytes(&[res(1, "12345")]), 5);
    }
}
