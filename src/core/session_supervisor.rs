//! 会话监管：中断管理
//!
//! 持有 CancellationToken，用户 Ctrl+C 时取消当前运行；编排器在每个节点开始前检查。

use tokio_util::sync::CancellationToken;

/// 单次运行的取消令牌
#[derive(Debug, Clone, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（用户 Ctrl+C）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 后台监听 Ctrl+C，收到后取消令牌
    pub fn install_ctrl_c(&self) {
        let token = self.cancel_token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, finishing the current node and stopping");
                token.cancel();
            }
        });
    }
}
