//! 核心编排层：错误与恢复、会话状态、路由、会话监管、主控循环与运行报告

pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod report;
pub mod router;
pub mod session;
pub mod session_supervisor;
pub mod state;

pub use error::{AgentError, RecoveryAction};
pub use orchestrator::{create_llm_from_config, Collaborators, Orchestrator, RunOutcome};
pub use recovery::RecoveryEngine;
pub use report::write_report;
pub use router::{RouteDecision, RouteReason, Router, RoutingPolicy};
pub use session::{new_session, SessionContext};
pub use session_supervisor::SessionSupervisor;
pub use state::{GuidanceChange, NodeId, Objective, RunStatus, SessionState, StateUpdate, Termination};
