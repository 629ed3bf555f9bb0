//! 会话上下文：每次运行独立构造，不存在进程级单例
//!
//! new_session 按配置创建 SessionState（重复检测环形缓冲、失败历史、动作历史容量、初始置信度）。

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::core::state::{Objective, SessionState};
use crate::memory::working::ActionHistory;
use crate::react::reflector::FailureHistory;
use crate::signals::repetition::RepetitionDetector;

#[derive(Debug, Clone)]
pub struct SessionContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
}

pub fn new_session(objective: Objective, cfg: &AppConfig) -> SessionContext {
    let state = SessionState::new(objective, cfg.control.max_attempts)
        .with_initial_confidence(cfg.control.initial_confidence)
        .with_repetition_detector(RepetitionDetector::new(
            cfg.repetition.window,
            cfg.repetition.capacity,
        ))
        .with_action_history(ActionHistory::new(cfg.control.action_history_capacity))
        .with_failure_history(FailureHistory::new(cfg.reflector.history_capacity));
    let ctx = SessionContext {
        run_id: Uuid::new_v4(),
        started_at: Utc::now(),
        state,
    };
    tracing::info!(run_id = %ctx.run_id, target = %ctx.state.objective.target, "new session");
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sessions_are_independent() {
        let cfg = AppConfig::default();
        let mut a = new_session(Objective::new("http://a", "g"), &cfg);
        let b = new_session(Objective::new("http://b", "g"), &cfg);
        a.state.recent_requests.record(crate::signals::RequestFingerprint::parse("x=1"), 10);
        a.state.consecutive_failures = 5;
        assert_ne!(a.run_id, b.run_id);
        assert!(b.state.recent_requests.is_empty());
        assert_eq!(b.state.consecutive_failures, 0);
        assert_eq!(b.state.max_attempts, 50);
    }
}
