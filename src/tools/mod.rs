//! 外部协作者：执行沙箱、工具执行器（超时 + 审计）、结果验证器、事实抽取器

pub mod executor;
pub mod extractor;
pub mod sandbox;
pub mod validator;

pub use executor::ToolExecutor;
pub use extractor::{FactExtractor, PatternExtractor};
pub use sandbox::{ExecutionSandbox, SandboxOutput, ShellSandbox, EXECUTE_COMMAND, EXECUTE_PYTHON};
pub use validator::{ExpectedValueValidator, ResultValidator, DEFAULT_ARTIFACT_PATTERN};
