//! 工具执行器
//!
//! 持有沙箱与全局超时，execute(request) 在超时内调用 sandbox.run，
//! 超时转为 SandboxTimeout；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::AgentError;
use crate::memory::transcript::ActionRequest;
use crate::tools::sandbox::{ExecutionSandbox, SandboxOutput};

/// 沙箱以外再留的宽限时间，防止实现方忽略传入的超时
const GRACE: Duration = Duration::from_secs(2);

pub struct ToolExecutor {
    sandbox: Arc<dyn ExecutionSandbox>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(sandbox: Arc<dyn ExecutionSandbox>, timeout_secs: u64) -> Self {
        Self {
            sandbox,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn execute(&self, request: &ActionRequest) -> Result<SandboxOutput, AgentError> {
        let start = Instant::now();
        let result = match timeout(self.timeout + GRACE, self.sandbox.run(request, self.timeout)).await {
            Ok(r) => r,
            Err(_) => Err(AgentError::SandboxTimeout(self.timeout.as_secs())),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(AgentError::SandboxTimeout(_)) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "id": request.id,
            "tool": request.tool,
            "ok": result.is_ok(),
            "outcome": outcome,
            "exit_status": result.as_ref().ok().and_then(|o| o.exit_status),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&request.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
