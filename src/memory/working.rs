//! 中期记忆：最近 N 步的动作摘要
//!
//! 环形缓冲，供 Router 的无进展判断与 Planner 的 Prompt 片段（What has been tried）使用；不受压缩影响。

use std::collections::VecDeque;

use serde::Serialize;

/// 单步动作的可读摘要
#[derive(Clone, Debug, Serialize)]
pub struct ActionRecord {
    pub attempt: u32,
    pub tool: String,
    pub succeeded: bool,
    pub summary: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct ActionHistory {
    entries: VecDeque<ActionRecord>,
    #[serde(skip)]
    capacity: usize,
}

impl ActionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: ActionRecord) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionRecord> {
        self.entries.iter()
    }

    /// 最近 n 步中成功的步数
    pub fn successes_in_last(&self, n: usize) -> usize {
        self.entries
            .iter()
            .rev()
            .take(n)
            .filter(|r| r.succeeded)
            .count()
    }

    /// 构建 Prompt 片段（What has been tried）
    pub fn to_prompt_section(&self, last: usize) -> String {
        if self.entries.is_empty() {
            return String::new();
        }
        let skip = self.entries.len().saturating_sub(last);
        let mut s = String::from("## What has been tried\n");
        for r in self.entries.iter().skip(skip) {
            let mark = if r.succeeded { "ok" } else { "fail" };
            s.push_str(&format!("- #{} [{}] {}: {}\n", r.attempt, mark, r.tool, r.summary));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(attempt: u32, succeeded: bool) -> ActionRecord {
        ActionRecord {
            attempt,
            tool: "execute_command".into(),
            succeeded,
            summary: format!("step {attempt}"),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut h = ActionHistory::new(3);
        for i in 1..=5 {
            h.push(record(i, false));
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.iter().next().map(|r| r.attempt), Some(3));
    }

    #[test]
    fn test_successes_in_last_window() {
        let mut h = ActionHistory::new(20);
        h.push(record(1, true));
        for i in 2..=11 {
            h.push(record(i, false));
        }
        assert_eq!(h.successes_in_last(10), 0);
        assert_eq!(h.successes_in_last(11), 1);
    }

    #[test]
    fn test_prompt_section_marks_outcome() {
        let mut h = ActionHistory::new(5);
        h.push(record(1, true));
        h.push(record(2, false));
        let s = h.to_prompt_section(1);
        assert!(s.contains("#2 [fail]"));
        assert!(!s.contains("#1"));
    }
}
