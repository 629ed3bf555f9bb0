//! 上下文压缩
//!
//! 转写超过条数或字节上限时，先把全部条目的持久事实抽取进 discoveries（幂等），
//! 再在不拆开请求/结果对的安全切点处把头部替换为一条摘要。
//! 摘要只包含 discoveries 与当前的重复警告；没有结构化内容时才附上头部的文字梗概。

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::memory::discoveries::DiscoveryStore;
use crate::memory::transcript::{total_bytes, TranscriptEntry};
use crate::tools::extractor::FactExtractor;

/// 每个类别在摘要中最多列出的条数
const SUMMARY_PER_CATEGORY: usize = 15;

/// 一次压缩的结果
#[derive(Debug, Clone)]
pub struct Compression {
    pub entries: Vec<TranscriptEntry>,
    /// 被摘要替换的头部条数
    pub summarized: usize,
    /// 因缺少配对而丢弃的尾部条数
    pub dropped_unpaired: usize,
    pub new_facts: usize,
    pub extraction_failed: bool,
}

#[derive(Debug, Clone)]
pub struct ContextCompressor {
    max_entries: usize,
    max_bytes: usize,
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self::new(20, 60_000)
    }
}

impl ContextCompressor {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
        }
    }

    pub fn should_compress(&self, transcript: &[TranscriptEntry]) -> bool {
        transcript.len() > self.max_entries || total_bytes(transcript) > self.max_bytes
    }

    pub fn compress(
        &self,
        transcript: &[TranscriptEntry],
        keep_recent: usize,
        discoveries: &mut DiscoveryStore,
        extractor: &dyn FactExtractor,
        repetition_warning: Option<&str>,
    ) -> Compression {
        // (a) 全量抽取，重复事实由 DiscoveryStore 去重
        let mut new_facts = 0;
        let mut extraction_failed = false;
        for entry in transcript {
            if let TranscriptEntry::Summary { .. } = entry {
                continue;
            }
            match extractor.extract(&entry.render(), "transcript") {
                Ok(facts) => new_facts += discoveries.extend(facts),
                Err(e) => {
                    if !extraction_failed {
                        tracing::warn!("Fact extraction failed during compression: {}", e);
                    }
                    extraction_failed = true;
                }
            }
        }

        // (b)(c) 头尾划分与安全切点
        let naive = transcript.len().saturating_sub(keep_recent);
        let cut = safe_cut(transcript, naive);
        if cut == 0 {
            return Compression {
                entries: transcript.to_vec(),
                summarized: 0,
                dropped_unpaired: 0,
                new_facts,
                extraction_failed,
            };
        }
        let (head, tail) = transcript.split_at(cut);
        let (tail, dropped_unpaired) = drop_unpaired(tail);

        // (d) 头部替换为摘要
        let mut text = format!("{} earlier entries compressed.\n", head.len());
        let structural = discoveries.to_prompt_context(SUMMARY_PER_CATEGORY);
        if !structural.is_empty() {
            text.push('\n');
            text.push_str(&structural);
        }
        if let Some(warning) = repetition_warning {
            text.push_str(&format!("\n## Active warning\n{warning}\n"));
        }
        if structural.is_empty() || extraction_failed {
            text.push('\n');
            text.push_str(&digest(head));
        }

        tracing::info!(
            summarized = head.len(),
            kept = tail.len(),
            dropped_unpaired,
            new_facts,
            "transcript compressed"
        );

        let mut entries = Vec::with_capacity(tail.len() + 1);
        entries.push(TranscriptEntry::Summary { text });
        entries.extend(tail);
        Compression {
            entries,
            summarized: head.len(),
            dropped_unpaired,
            new_facts,
            extraction_failed,
        }
    }
}

/// 从朴素切点向前回退，直到没有请求/结果对跨越边界；切点只会变小，保留的条数不少于调用方要求
pub fn safe_cut(transcript: &[TranscriptEntry], naive: usize) -> usize {
    let request_index: HashMap<u64, usize> = transcript
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match e {
            TranscriptEntry::ActionRequest(req) => Some((req.id, i)),
            _ => None,
        })
        .collect();

    let mut cut = naive.min(transcript.len());
    loop {
        let straddling = transcript[cut..]
            .iter()
            .filter_map(|e| match e {
                TranscriptEntry::ActionResult(res) => request_index.get(&res.request_id).copied(),
                _ => None,
            })
            .filter(|&idx| idx < cut)
            .min();
        match straddling {
            Some(idx) => cut = idx,
            None => return cut,
        }
    }
}

/// 丢弃尾部中没有配对的请求或结果（二者都不单独保留）
fn drop_unpaired(tail: &[TranscriptEntry]) -> (Vec<TranscriptEntry>, usize) {
    let requests: HashSet<u64> = tail
        .iter()
        .filter_map(|e| match e {
            TranscriptEntry::ActionRequest(req) => Some(req.id),
            _ => None,
        })
        .collect();
    let results: HashSet<u64> = tail
        .iter()
        .filter_map(|e| match e {
            TranscriptEntry::ActionResult(res) => Some(res.request_id),
            _ => None,
        })
        .collect();
    let kept: Vec<TranscriptEntry> = tail
        .iter()
        .filter(|e| match e {
            TranscriptEntry::ActionRequest(req) => results.contains(&req.id),
            TranscriptEntry::ActionResult(res) => requests.contains(&res.request_id),
            _ => true,
        })
        .cloned()
        .collect();
    let dropped = tail.len() - kept.len();
    (kept, dropped)
}

/// 头部的结构化梗概：工具使用次数、失败结果、最后的指导
fn digest(head: &[TranscriptEntry]) -> String {
    let mut tools: BTreeMap<&str, usize> = BTreeMap::new();
    let mut failures: Vec<String> = Vec::new();
    let mut last_guidance: Option<&str> = None;
    for entry in head {
        match entry {
            TranscriptEntry::ActionRequest(req) => *tools.entry(req.tool.as_str()).or_default() += 1,
            TranscriptEntry::ActionResult(res) if res.timed_out || res.exit_status.unwrap_or(0) != 0 => {
                let line = res.output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                failures.push(format!("#{}: {}", res.request_id, truncate(line, 120)));
            }
            TranscriptEntry::PlannerNote { text } => last_guidance = Some(text),
            _ => {}
        }
    }
    let mut s = String::from("## Digest of compressed steps\n");
    if tools.is_empty() {
        s.push_str("- no actions were executed\n");
    } else {
        let used = tools
            .iter()
            .map(|(t, n)| format!("{t} x{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        s.push_str(&format!("- actions: {used}\n"));
    }
    for f in failures.iter().rev().take(5) {
        s.push_str(&format!("- failed {f}\n"));
    }
    if let Some(g) = last_guidance {
        s.push_str(&format!("- last guidance: {}\n", truncate(g, 300)));
    }
    s
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}
