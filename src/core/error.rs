//! 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定记为 L1 传输失败、采用保守默认值或终止整个运行。

use thiserror::Error;

/// 编排循环中可能出现的错误（预言机、沙箱、解析、配置、节点崩溃等）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 预言机调用超时（传输类，可恢复）
    #[error("Oracle timeout after {0}s")]
    OracleTimeout(u64),

    /// 预言机不可达或返回错误（传输类，可恢复）
    #[error("Oracle unavailable: {0}")]
    OracleUnavailable(String),

    /// 预言机输出无法解码为期望结构
    #[error("Oracle output parse error: {0}")]
    ParseError(String),

    #[error("Sandbox timeout after {0}s")]
    SandboxTimeout(u64),

    #[error("Sandbox execution failed: {0}")]
    SandboxFailed(String),

    /// 沙箱拒绝执行的命令（命中宿主破坏性模式）
    #[error("Forbidden command pattern: {0}")]
    ForbiddenCommand(String),

    /// 模型请求了不存在的工具
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Fact extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 节点内部 panic，被编排器捕获
    #[error("Node panicked: {0}")]
    NodePanicked(String),

    /// 会话状态不一致（例如找不到待执行的请求）
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 传输类错误：预言机 / 沙箱不可达或超时，一律按 L1 处理
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AgentError::OracleTimeout(_)
                | AgentError::OracleUnavailable(_)
                | AgentError::SandboxTimeout(_)
                | AgentError::SandboxFailed(_)
        )
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 作为 L1 失败写入结果并交给 Reflector（传输/工具类）
    RecordTransportFailure(String),
    /// 本地用保守默认值继续（解析失败、抽取失败）
    UseDefault(String),
    /// 把错误作为一次被拒绝的动作反馈给模型，不终止运行
    RejectAction(String),
    /// 终止当前运行，最终状态为 error
    Abort,
}
