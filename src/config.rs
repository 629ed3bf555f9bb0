//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PROWL__*` 覆盖（双下划线表示嵌套，如 `PROWL__CONTROL__MAX_ATTEMPTS=30`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::tools::validator::DEFAULT_ARTIFACT_PATTERN;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub control: ControlSection,
    pub compression: CompressionSection,
    pub repetition: RepetitionSection,
    pub reflector: ReflectorSection,
    pub sandbox: SandboxSection,
    pub validator: ValidatorSection,
}

/// [app] 段：应用名、报告目录、指令目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 运行报告输出目录
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// 各角色指令（<role>.md）所在目录，未设置时查找 config/prompts
    pub prompts_dir: Option<PathBuf>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs")
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            output_dir: default_output_dir(),
            prompts_dir: None,
        }
    }
}

/// [llm] 段：后端选择、超时与按角色覆盖的模型
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 规划角色使用的模型（为空时用 model）
    pub planner_model: Option<String>,
    /// 评估角色使用的模型，与执行者分开可以避免自我认同
    pub reflector_model: Option<String>,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
            planner_model: None,
            reflector_model: None,
        }
    }
}

/// 检查点间隔档位：尝试次数达到 from_attempt 后使用 interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CheckpointTier {
    pub from_attempt: u32,
    pub interval: u32,
}

/// [control] 段：尝试上限、步数上限与路由阈值
#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 全局步数上限 = max_attempts × step_ceiling_factor
    #[serde(default = "default_step_ceiling_factor")]
    pub step_ceiling_factor: u32,
    /// 连续失败基础阈值 T（失败数达到 2T 后缩小为 2）
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
    #[serde(default = "default_checkpoint_tiers")]
    pub checkpoint_tiers: Vec<CheckpointTier>,
    /// 在最近多少条转写中查找已验证的结果
    #[serde(default = "default_verified_lookback")]
    pub verified_lookback: usize,
    /// 尝试数达到该值且最近这么多步无一成功时重新规划
    #[serde(default = "default_no_progress_after")]
    pub no_progress_after: u32,
    #[serde(default = "default_initial_confidence")]
    pub initial_confidence: f64,
    /// 中档置信度下触发升级的连续失败数
    #[serde(default = "default_escalation_failures")]
    pub escalation_failures: u32,
    /// 使用评估预言机判定单步结果（失败时回退到启发式）
    #[serde(default)]
    pub oracle_confidence: bool,
    #[serde(default = "default_action_history_capacity")]
    pub action_history_capacity: usize,
}

fn default_max_attempts() -> u32 {
    50
}

fn default_step_ceiling_factor() -> u32 {
    4
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_checkpoint_interval() -> u32 {
    5
}

fn default_checkpoint_tiers() -> Vec<CheckpointTier> {
    vec![
        CheckpointTier {
            from_attempt: 15,
            interval: 4,
        },
        CheckpointTier {
            from_attempt: 30,
            interval: 3,
        },
    ]
}

fn default_verified_lookback() -> usize {
    5
}

fn default_no_progress_after() -> u32 {
    10
}

fn default_initial_confidence() -> f64 {
    50.0
}

fn default_escalation_failures() -> u32 {
    3
}

fn default_action_history_capacity() -> usize {
    20
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            step_ceiling_factor: default_step_ceiling_factor(),
            failure_threshold: default_failure_threshold(),
            checkpoint_interval: default_checkpoint_interval(),
            checkpoint_tiers: default_checkpoint_tiers(),
            verified_lookback: default_verified_lookback(),
            no_progress_after: default_no_progress_after(),
            initial_confidence: default_initial_confidence(),
            escalation_failures: default_escalation_failures(),
            oracle_confidence: false,
            action_history_capacity: default_action_history_capacity(),
        }
    }
}

/// [compression] 段
#[derive(Debug, Clone, Deserialize)]
pub struct CompressionSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// 单次工具输出超过该字符数时只保留头尾
    #[serde(default = "default_tool_output_limit")]
    pub tool_output_limit: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    20
}

fn default_max_bytes() -> usize {
    60_000
}

fn default_keep_recent() -> usize {
    10
}

fn default_tool_output_limit() -> usize {
    5000
}

impl Default for CompressionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_entries(),
            max_bytes: default_max_bytes(),
            keep_recent: default_keep_recent(),
            tool_output_limit: default_tool_output_limit(),
        }
    }
}

/// [repetition] 段
#[derive(Debug, Clone, Deserialize)]
pub struct RepetitionSection {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_window() -> usize {
    3
}

fn default_capacity() -> usize {
    10
}

impl Default for RepetitionSection {
    fn default() -> Self {
        Self {
            window: default_window(),
            capacity: default_capacity(),
        }
    }
}

/// [reflector] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ReflectorSection {
    #[serde(default = "default_capacity")]
    pub history_capacity: usize,
    /// 允许判定 L5 所需的连续 L4+ 判定数（含本次）
    #[serde(default = "default_strategic_streak")]
    pub strategic_streak: usize,
}

fn default_strategic_streak() -> usize {
    3
}

impl Default for ReflectorSection {
    fn default() -> Self {
        Self {
            history_capacity: default_capacity(),
            strategic_streak: default_strategic_streak(),
        }
    }
}

/// [sandbox] 段：命令前缀（如 docker exec kali）、解释器与超时
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSection {
    #[serde(default)]
    pub command_prefix: Vec<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_sandbox_timeout() -> u64 {
    120
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            command_prefix: Vec::new(),
            shell: default_shell(),
            python: default_python(),
            timeout_secs: default_sandbox_timeout(),
        }
    }
}

/// [validator] 段：期望结果与候选模式
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorSection {
    pub expected: Option<String>,
    pub expected_file: Option<PathBuf>,
    #[serde(default = "default_pattern")]
    pub pattern: String,
}

fn default_pattern() -> String {
    DEFAULT_ARTIFACT_PATTERN.to_string()
}

impl Default for ValidatorSection {
    fn default() -> Self {
        Self {
            expected: None,
            expected_file: None,
            pattern: default_pattern(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 PROWL__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PROWL__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("Config file {} not found, ignored", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PROWL")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
