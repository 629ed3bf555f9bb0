//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供各节点决定是记为 L1、使用默认值、拒绝动作还是终止。

use crate::core::{AgentError, RecoveryAction};

/// 被拒绝动作的结果前缀；Reflector 据此把它识别为工具层失败（L1），而非目标侧拦截
pub const REJECTION_PREFIX: &str = "action rejected: ";

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作
    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::OracleTimeout(_)
            | AgentError::OracleUnavailable(_)
            | AgentError::SandboxTimeout(_)
            | AgentError::SandboxFailed(_) => {
                RecoveryAction::RecordTransportFailure(err.to_string())
            }
            AgentError::ParseError(raw) => {
                RecoveryAction::UseDefault(format!("unparseable oracle output: {raw}"))
            }
            AgentError::ExtractionFailed(msg) => {
                RecoveryAction::UseDefault(format!("fact extraction failed: {msg}"))
            }
            AgentError::ForbiddenCommand(pattern) => RecoveryAction::RejectAction(format!(
                "{REJECTION_PREFIX}command contains forbidden pattern '{pattern}'"
            )),
            AgentError::UnknownTool(name) => RecoveryAction::RejectAction(format!(
                "{REJECTION_PREFIX}tool '{name}' does not exist; use execute_command, execute_python or submit_result"
            )),
            AgentError::ConfigError(_)
            | AgentError::Io(_)
            | AgentError::NodePanicked(_)
            | AgentError::InvalidState(_)
            | AgentError::Cancelled => RecoveryAction::Abort,
        }
    }
}
