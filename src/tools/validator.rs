//! 结果验证器
//!
//! 唯一有权设置 result / VERIFIED 的组件。文本匹配候选模式只是必要条件：
//! 没有期望值时任何候选都不会被确认。

use std::path::Path;

use regex::Regex;

use crate::config::ValidatorSection;
use crate::core::AgentError;

/// 默认候选模式：flag{...}，允许一层嵌套花括号
pub const DEFAULT_ARTIFACT_PATTERN: &str = r"(?i)flag\{(?:[^{}]|\{[^{}]*\})+\}";

pub trait ResultValidator: Send + Sync {
    /// 文本中出现的候选结果（去重，保持出现顺序）
    fn candidates(&self, text: &str) -> Vec<String>;

    fn verify(&self, candidate: &str) -> bool;
}

/// 与期望值比较（去首尾空白、大小写不敏感）
#[derive(Debug, Clone)]
pub struct ExpectedValueValidator {
    expected: Option<String>,
    pattern: Regex,
}

impl ExpectedValueValidator {
    pub fn new(expected: Option<String>, pattern: &str) -> Result<Self, AgentError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| AgentError::ConfigError(format!("invalid artifact pattern: {e}")))?;
        Ok(Self {
            expected: expected
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty()),
            pattern,
        })
    }

    /// 期望值来源优先级：配置 expected > 环境变量 PROWL_EXPECTED_RESULT > expected_file
    pub fn from_config(section: &ValidatorSection) -> Result<Self, AgentError> {
        let expected = section
            .expected
            .clone()
            .or_else(|| std::env::var("PROWL_EXPECTED_RESULT").ok())
            .or_else(|| section.expected_file.as_deref().and_then(read_expected_file));
        if expected.is_none() {
            tracing::warn!("No expected result configured; no candidate can be verified");
        }
        Self::new(expected, &section.pattern)
    }

    pub fn has_expected(&self) -> bool {
        self.expected.is_some()
    }
}

fn read_expected_file(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) => {
            tracing::warn!("Cannot read expected result file {}: {}", path.display(), e);
            None
        }
    }
}

impl ResultValidator for ExpectedValueValidator {
    fn candidates(&self, text: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        for m in self.pattern.find_iter(text) {
            let candidate = m.as_str().trim().to_string();
            if !found.contains(&candidate) {
                found.push(candidate);
            }
        }
        found
    }

    fn verify(&self, candidate: &str) -> bool {
        let verified = self
            .expected
            .as_deref()
            .map(|expected| expected.eq_ignore_ascii_case(candidate.trim()))
            .unwrap_or(false);
        // 路由每一步都会调用，只在 debug 级别记录；提交结果由 ToolRunner 以 info 记录
        tracing::debug!(candidate = %candidate, verified, "result validation");
        verified
    }
}
