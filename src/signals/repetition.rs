//! 重复 / 停滞检测
//!
//! 在最近的 (请求指纹, 响应签名, 错误类别) 记录上做滑动窗口分析，按顺序匹配四类模式：
//! 完全相同请求、同结构不同取值、响应不变、同类错误反复出现。

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// 规范化的请求指纹：按键排序的键值对，与表单 / JSON 等序列化形式无关
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestFingerprint {
    pairs: BTreeMap<String, String>,
}

impl RequestFingerprint {
    /// 解析 JSON 对象或 `k=v&k=v` 表单串
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
                return Self::from_json(&value);
            }
        }
        Self::from_form(raw)
    }

    pub fn from_form(raw: &str) -> Self {
        let pairs = raw
            .split('&')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                None => (p.to_string(), String::new()),
            })
            .collect();
        Self { pairs }
    }

    /// 顶层对象的键值；非字符串取值用其 JSON 文本
    pub fn from_json(value: &serde_json::Value) -> Self {
        let pairs = match value.as_object() {
            Some(map) => map
                .iter()
                .map(|(k, v)| {
                    let v = v.as_str().map(String::from).unwrap_or_else(|| v.to_string());
                    (k.clone(), v)
                })
                .collect(),
            None => BTreeMap::new(),
        };
        Self { pairs }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn key_set(&self) -> BTreeSet<&str> {
        self.pairs.keys().map(String::as_str).collect()
    }

    fn merge(&mut self, other: RequestFingerprint) {
        self.pairs.extend(other.pairs);
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        f.write_str(&joined)
    }
}

/// 响应签名（默认为响应长度）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResponseSignature(pub u64);

impl From<u64> for ResponseSignature {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl ResponseSignature {
    /// 输出中显式给出的长度（len / length / size / Content-Length / N bytes），否则取输出字节数
    pub fn from_output(output: &str) -> Self {
        static LEN_RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = LEN_RE.get_or_init(|| {
            Regex::new(r"(?i)(?:content-length|\blen|\blength|\bsize)\s*[:=]\s*(\d+)|(\d+)\s*bytes\b")
                .ok()
        });
        let explicit = re.as_ref().and_then(|re| {
            re.captures(output).and_then(|c| {
                c.get(1)
                    .or_else(|| c.get(2))
                    .and_then(|m| m.as_str().parse::<u64>().ok())
            })
        });
        Self(explicit.unwrap_or(output.len() as u64))
    }
}

/// 可识别的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    ConnectionRefused,
    Unauthorized,
    Forbidden,
    NotFound,
    ServerError,
}

impl ErrorCategory {
    pub fn detect(output: &str) -> Option<Self> {
        static CODE_RE: OnceLock<Option<Regex>> = OnceLock::new();
        let lower = output.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            return Some(Self::Timeout);
        }
        if lower.contains("connection refused") || lower.contains("failed to connect") {
            return Some(Self::ConnectionRefused);
        }
        if lower.contains("unauthorized") {
            return Some(Self::Unauthorized);
        }
        if lower.contains("forbidden") {
            return Some(Self::Forbidden);
        }
        if lower.contains("not found") {
            return Some(Self::NotFound);
        }
        if lower.contains("internal server error") {
            return Some(Self::ServerError);
        }
        let re = CODE_RE.get_or_init(|| Regex::new(r"\b(401|403|404|50[0-4])\b").ok());
        let code = re.as_ref()?.captures(&lower)?.get(1)?.as_str().to_string();
        match code.as_str() {
            "401" => Some(Self::Unauthorized),
            "403" => Some(Self::Forbidden),
            "404" => Some(Self::NotFound),
            _ => Some(Self::ServerError),
        }
    }
}

/// 检测到的重复模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepetitionPattern {
    IdenticalRequest,
    SimilarPayload,
    IdenticalResponse,
    RepeatedError,
}

impl RepetitionPattern {
    /// 人类可读的修正建议
    pub fn hint(&self) -> &'static str {
        match self {
            Self::IdenticalRequest => {
                "The exact same request has been sent repeatedly with the same response. \
                 Stop resending it; change the parameters, endpoint or technique."
            }
            Self::SimilarPayload => {
                "Only parameter values are changing and the response never changes. \
                 The parameter is probably not injectable this way; test a different parameter or vector."
            }
            Self::IdenticalResponse => {
                "Different requests keep producing an identical response. \
                 The input is likely ignored or filtered; verify the request actually reaches the target."
            }
            Self::RepeatedError => {
                "The same error keeps occurring. Fix the underlying cause \
                 (tooling, connectivity, authentication) before retrying."
            }
        }
    }
}

impl fmt::Display for RepetitionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IdenticalRequest => "IDENTICAL_REQUEST",
            Self::SimilarPayload => "SIMILAR_PAYLOAD",
            Self::IdenticalResponse => "IDENTICAL_RESPONSE",
            Self::RepeatedError => "REPEATED_ERROR",
        };
        f.write_str(s)
    }
}

/// 一次记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestRecord {
    pub fingerprint: RequestFingerprint,
    pub signature: ResponseSignature,
    pub error: Option<ErrorCategory>,
}

/// 固定容量环形缓冲上的滑动窗口检测器；窗口大小在构造时固定
#[derive(Debug, Clone)]
pub struct RepetitionDetector {
    window: usize,
    capacity: usize,
    records: VecDeque<RequestRecord>,
}

impl Default for RepetitionDetector {
    fn default() -> Self {
        Self::new(3, 10)
    }
}

impl RepetitionDetector {
    pub fn new(window: usize, capacity: usize) -> Self {
        let window = window.max(1);
        let capacity = capacity.max(window);
        Self {
            window,
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    pub fn record(&mut self, fingerprint: RequestFingerprint, signature: u64) {
        self.push(RequestRecord {
            fingerprint,
            signature: signature.into(),
            error: None,
        });
    }

    pub fn push(&mut self, record: RequestRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn detect(&self) -> Option<RepetitionPattern> {
        if self.records.len() < self.window {
            return None;
        }
        let recent: Vec<&RequestRecord> = self
            .records
            .iter()
            .skip(self.records.len() - self.window)
            .collect();
        let first = recent[0];
        let same_signature = recent.iter().all(|r| r.signature == first.signature);
        let fingerprints_present = recent.iter().all(|r| !r.fingerprint.is_empty());

        if fingerprints_present && same_signature {
            if recent.iter().all(|r| r.fingerprint == first.fingerprint) {
                return Some(RepetitionPattern::IdenticalRequest);
            }
            let keys = first.fingerprint.key_set();
            if recent.iter().all(|r| r.fingerprint.key_set() == keys) {
                return Some(RepetitionPattern::SimilarPayload);
            }
        }
        if same_signature {
            return Some(RepetitionPattern::IdenticalResponse);
        }
        if let Some(category) = first.error {
            if recent.iter().all(|r| r.error == Some(category)) {
                return Some(RepetitionPattern::RepeatedError);
            }
        }
        None
    }

    /// 当前激活的警告文本
    pub fn warning(&self) -> Option<String> {
        self.detect()
            .map(|p| format!("Repetition detected ({p}): {}", p.hint()))
    }
}

/// 从命令文本中提取请求参数（`data={...}`、`params={...}`、`curl -d '...'` / `--data`）
pub fn extract_request_params(command: &str) -> Option<RequestFingerprint> {
    static DICT_RE: OnceLock<Option<Regex>> = OnceLock::new();
    static PAIR_RE: OnceLock<Option<Regex>> = OnceLock::new();
    static CURL_RE: OnceLock<Option<Regex>> = OnceLock::new();

    let dict_re = DICT_RE
        .get_or_init(|| Regex::new(r"\b(?:data|params|json)\s*=\s*(\{[^}]*\})").ok())
        .as_ref()?;
    let pair_re = PAIR_RE
        .get_or_init(|| Regex::new(r#"['"]([^'"]+)['"]\s*:\s*['"]?([^,'"}]*)['"]?"#).ok())
        .as_ref()?;
    let curl_re = CURL_RE
        .get_or_init(|| {
            Regex::new(r#"(?:\s-d|--data(?:-raw|-urlencode|-binary)?)\s+(?:'([^']*)'|"([^"]*)"|(\S+))"#)
                .ok()
        })
        .as_ref()?;

    let mut fp = RequestFingerprint::default();
    for caps in dict_re.captures_iter(command) {
        let body = &caps[1];
        let parsed = RequestFingerprint::parse(&body.replace('\'', "\""));
        if parsed.is_empty() {
            let mut loose = BTreeMap::new();
            for pair in pair_re.captures_iter(body) {
                loose.insert(pair[1].trim().to_string(), pair[2].trim().to_string());
            }
            fp.merge(RequestFingerprint { pairs: loose });
        } else {
            fp.merge(parsed);
        }
    }
    for caps in curl_re.captures_iter(command) {
        let body = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str())
            .unwrap_or("");
        fp.merge(RequestFingerprint::parse(body));
    }
    if fp.is_empty() {
        None
    } else {
        Some(fp)
    }
}
