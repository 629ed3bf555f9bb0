//! 持久事实（discoveries）
//!
//! 只增不减、按 (category, content) 去重；压缩器永不驱逐，重复抽取同一事实是空操作。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 一条抽取出的持久事实
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub category: String,
    pub content: String,
    pub source: String,
    /// 0-100
    pub confidence: u8,
    pub discovered_at: DateTime<Utc>,
}

impl Discovery {
    pub fn new(
        category: impl Into<String>,
        content: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            content: content.into(),
            source: source.into(),
            confidence: 80,
            discovered_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: u8) -> Self {
        self.confidence = confidence.min(100);
        self
    }

    fn key(&self) -> (String, String) {
        (self.category.clone(), self.content.trim().to_string())
    }
}

/// 去重的事实集合，保持发现顺序
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryStore {
    items: Vec<Discovery>,
    #[serde(skip)]
    seen: HashSet<(String, String)>,
}

impl DiscoveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入一条事实；已存在时返回 false
    pub fn add(&mut self, discovery: Discovery) -> bool {
        if discovery.content.trim().is_empty() {
            return false;
        }
        if !self.seen.insert(discovery.key()) {
            return false;
        }
        tracing::debug!(
            category = %discovery.category,
            content = %discovery.content,
            "new discovery"
        );
        self.items.push(discovery);
        true
    }

    /// 批量插入，返回新增数量
    pub fn extend(&mut self, discoveries: impl IntoIterator<Item = Discovery>) -> usize {
        discoveries
            .into_iter()
            .filter(|d| self.add(d.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Discovery] {
        &self.items
    }

    pub fn by_category<'a>(&'a self, category: &'a str) -> impl Iterator<Item = &'a Discovery> {
        self.items.iter().filter(move |d| d.category == category)
    }

    /// 按类别分组渲染，每类最多 per_category 条（最新优先）
    pub fn to_prompt_context(&self, per_category: usize) -> String {
        if self.items.is_empty() {
            return String::new();
        }
        let mut categories: Vec<&str> = Vec::new();
        for d in &self.items {
            if !categories.contains(&d.category.as_str()) {
                categories.push(&d.category);
            }
        }
        let mut s = String::from("## Discoveries\n");
        for category in categories {
            let entries: Vec<&Discovery> = self.by_category(category).collect();
            s.push_str(&format!("### {} ({})\n", category, entries.len()));
            for d in entries.iter().rev().take(per_category) {
                s.push_str(&format!("- {} (from {}, {}%)\n", d.content, d.source, d.confidence));
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_dedupes_on_category_and_content() {
        let mut store = DiscoveryStore::new();
        assert!(store.add(Discovery::new("endpoint", "/api/login", "tool")));
        assert!(!store.add(Discovery::new("endpoint", "/api/login", "reflector")));
        assert!(store.add(Discovery::new("form", "/api/login", "tool")));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_blank_content_ignored() {
        let mut store = DiscoveryStore::new();
        assert!(!store.add(Discovery::new("note", "   ", "tool")));
        assert!(store.is_empty());
    }

    #[test]
    fn test_extend_counts_only_new() {
        let mut store = DiscoveryStore::new();
        let batch = vec![
            Discovery::new("tech", "nginx/1.18", "tool"),
            Discovery::new("tech", "nginx/1.18", "tool"),
            Discovery::new("tech", "PHP/7.4", "tool"),
        ];
        assert_eq!(store.extend(batch.clone()), 2);
        assert_eq!(store.extend(batch), 0);
    }

    #[test]
    fn test_prompt_context_groups_by_category() {
        let mut store = DiscoveryStore::new();
        store.add(Discovery::new("endpoint", "/admin", "tool").with_confidence(150));
        store.add(Discovery::new("tech", "Apache/2.4", "tool"));
        let ctx = store.to_prompt_context(5);
        assert!(ctx.contains("### endpoint (1)"));
        assert!(ctx.contains("/admin (from tool, 100%)"));
        assert!(ctx.contains("### tech (1)"));
    }
}
