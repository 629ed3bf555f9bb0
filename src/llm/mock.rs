//! Mock LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 先按顺序返回预置回复；脚本耗尽后回显最后一条 User 消息的首行为 execute_command 动作。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let scripted = self
            .replies
            .lock()
            .map_err(|_| LlmError::ApiError("mock reply queue poisoned".to_string()))?
            .pop_front();
        if let Some(reply) = scripted {
            return Ok(reply);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .and_then(|m| m.content.lines().next())
            .unwrap_or("(no input)");

        Ok(serde_json::json!({
            "tool": "execute_command",
            "args": { "command": format!("echo 'Echo from Mock: {}'", last_user.replace('\'', "")) }
        })
        .to_string())
    }
}
