//! 执行沙箱：不透明的命令 / 脚本执行器
//!
//! ShellSandbox 通过可配置前缀（如 `docker exec <容器>`）执行 sh -c / python3 -c；
//! 禁止宿主破坏性子串；非零退出码不是错误，原样返回给 Reflector 判断。

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SandboxSection;
use crate::core::AgentError;
use crate::memory::transcript::ActionRequest;

pub const EXECUTE_COMMAND: &str = "execute_command";
pub const EXECUTE_PYTHON: &str = "execute_python";

/// 禁止的子串（无论是否在容器内都拒绝）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    "> /dev/sd",
    "shutdown",
    "reboot",
    ":(){ :|:& };:", // fork bomb
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOutput {
    pub stdout: String,
    pub exit_status: Option<i32>,
}

#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    async fn run(&self, request: &ActionRequest, timeout: Duration) -> Result<SandboxOutput, AgentError>;
}

pub struct ShellSandbox {
    prefix: Vec<String>,
    shell: String,
    python: String,
}

impl ShellSandbox {
    pub fn new(prefix: Vec<String>, shell: impl Into<String>, python: impl Into<String>) -> Self {
        Self {
            prefix,
            shell: shell.into(),
            python: python.into(),
        }
    }

    pub fn from_config(section: &SandboxSection) -> Self {
        Self::new(
            section.command_prefix.clone(),
            section.shell.clone(),
            section.python.clone(),
        )
    }

    fn check_forbidden(raw: &str) -> Result<(), AgentError> {
        let lower = raw.to_lowercase();
        match FORBIDDEN_SUBSTR.iter().find(|f| lower.contains(*f)) {
            Some(f) => Err(AgentError::ForbiddenCommand((*f).to_string())),
            None => Ok(()),
        }
    }

    /// 组装 argv：前缀 + 解释器 + -c + 正文
    pub fn argv(&self, request: &ActionRequest) -> Result<Vec<String>, AgentError> {
        let interpreter = match request.tool.as_str() {
            EXECUTE_COMMAND => &self.shell,
            EXECUTE_PYTHON => &self.python,
            other => return Err(AgentError::UnknownTool(other.to_string())),
        };
        let body = request
            .payload()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| AgentError::SandboxFailed(format!("{} requires a non-empty body", request.tool)))?;
        Self::check_forbidden(body)?;
        let mut argv = self.prefix.clone();
        argv.extend([interpreter.clone(), "-c".to_string(), body.to_string()]);
        Ok(argv)
    }
}

#[async_trait]
impl ExecutionSandbox for ShellSandbox {
    async fn run(&self, request: &ActionRequest, timeout: Duration) -> Result<SandboxOutput, AgentError> {
        let argv = self.argv(request)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AgentError::SandboxFailed("empty command line".to_string()))?;
        tracing::info!(tool = %request.tool, id = request.id, "sandbox execute");

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| AgentError::SandboxTimeout(timeout.as_secs()))?
            .map_err(|e| AgentError::SandboxFailed(format!("spawn {program}: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let stdout = if stderr.trim().is_empty() {
            stdout
        } else {
            format!("{}\nstderr: {}", stdout.trim_end(), stderr.trim())
        };
        Ok(SandboxOutput {
            stdout,
            exit_status: output.status.code(),
        })
    }
}
