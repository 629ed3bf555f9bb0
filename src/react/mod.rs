//! 认知层：决策预言机边界与四个节点（Planner、Executor、ToolRunner、Reflector）

pub mod events;
pub mod executor;
pub mod oracle;
pub mod planner;
pub mod prompts;
pub mod reflector;
pub mod tool_runner;

pub use events::LoopEvent;
pub use executor::{Executor, GUIDANCE_MARKER};
pub use oracle::{
    parse_oracle_output, ActionDraft, DecisionOracle, LlmOracle, OracleReply, OracleRole, TokenCount,
    TranscriptView,
};
pub use planner::{Planner, FALLBACK_GUIDANCE};
pub use prompts::PromptSet;
pub use reflector::{
    decode_verdict, enforce_escalation, EvidenceSignals, FailureHistory, FailureLevel, Reflector, Verdict,
    VerdictStatus,
};
pub use tool_runner::ToolRunner;
