//! 事实抽取器
//!
//! 压缩器与 Reflector 用它把文本中的持久事实写入 discoveries。抽取失败是显式的 Err 分支。

use regex::Regex;

use crate::core::AgentError;
use crate::memory::discoveries::Discovery;

pub trait FactExtractor: Send + Sync {
    fn extract(&self, text: &str, source: &str) -> Result<Vec<Discovery>, AgentError>;
}

/// 单条正则规则；group 为 0 时取整个匹配
#[derive(Debug, Clone)]
struct PatternRule {
    category: &'static str,
    regex: Regex,
    group: usize,
    confidence: u8,
}

/// 内置的正则抽取器：flag、API 端点、表单、SQL 报错、服务横幅
#[derive(Debug, Clone)]
pub struct PatternExtractor {
    rules: Vec<PatternRule>,
    max_content_len: usize,
}

impl PatternExtractor {
    pub fn new() -> Result<Self, AgentError> {
        let specs: [(&'static str, &str, usize, u8); 6] = [
            ("flag", r"(?i)flag\{[^}]+\}", 0, 95),
            ("api_endpoint", r#""(/[a-zA-Z_][a-zA-Z0-9_/\-]*)":\s*\{"#, 1, 85),
            ("form_action", r#"(?i)<form[^>]*\baction\s*=\s*["']([^"']+)["']"#, 1, 75),
            (
                "sql_error",
                r"(?i)(you have an error in your sql syntax[^\n]{0,80}|mysql_fetch_\w+|ora-\d{5}|sqlite3?\.\w*error[^\n]{0,60}|pg_query\(\))",
                1,
                80,
            ),
            ("technology", r"(?i)\b(?:server|x-powered-by):\s*([^\r\n]+)", 1, 70),
            (
                "credential",
                r#"(?i)\b(?:user(?:name)?|login)\s*[:=]\s*["']?(\w{2,32})["']?\s*[,;&\s]\s*(?:pass(?:word)?|pwd)\s*[:=]\s*["']?[^\s"',;&]{2,64}"#,
                0,
                70,
            ),
        ];
        let rules = specs
            .into_iter()
            .map(|(category, pattern, group, confidence)| {
                Regex::new(pattern)
                    .map(|regex| PatternRule {
                        category,
                        regex,
                        group,
                        confidence,
                    })
                    .map_err(|e| AgentError::ConfigError(format!("extraction rule {category}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            max_content_len: 200,
        })
    }
}

impl FactExtractor for PatternExtractor {
    fn extract(&self, text: &str, source: &str) -> Result<Vec<Discovery>, AgentError> {
        let mut facts = Vec::new();
        for rule in &self.rules {
            for caps in rule.regex.captures_iter(text) {
                let Some(m) = caps.get(rule.group).or_else(|| caps.get(0)) else {
                    continue;
                };
                let content: String = m.as_str().trim().chars().take(self.max_content_len).collect();
                if content.is_empty() {
                    continue;
                }
                facts.push(
                    Discovery::new(rule.category, content, source).with_confidence(rule.confidence),
                );
            }
        }
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(text: &str) -> Vec<(String, String)> {
        PatternExtractor::new()
            .unwrap()
            .extract(text, "test")
            .unwrap()
            .into_iter()
            .map(|d| (d.category, d.content))
            .collect()
    }

    #[test]
    fn test_extracts_flag_and_endpoints() {
        let facts = extract(r#"{"paths": {"/api/users": {"get": {}}, "/api/admin/export": {"post": {}}}} flag{demo}"#);
        assert!(facts.contains(&("api_endpoint".into(), "/api/users".into())));
        assert!(facts.contains(&("api_endpoint".into(), "/api/admin/export".into())));
        assert!(facts.contains(&("flag".into(), "flag{demo}".into())));
    }

    #[test]
    fn test_extracts_form_and_banner() {
        let facts = extract(
            "HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\nX-Powered-By: PHP/7.4.3\r\n\r\n<form method=\"post\" action=\"/login.php\">",
        );
        assert!(facts.contains(&("technology".into(), "nginx/1.18.0".into())));
        assert!(facts.contains(&("technology".into(), "PHP/7.4.3".into())));
        assert!(facts.contains(&("form_action".into(), "/login.php".into())));
    }

    #[test]
    fn test_extracts_sql_error() {
        let facts = extract("Warning: You have an error in your SQL syntax; check the manual");
        assert!(facts.iter().any(|(c, _)| c == "sql_error"));
    }

    #[test]
    fn test_plain_text_yields_nothing() {
        assert!(extract("nothing interesting here").is_empty());
    }
}
