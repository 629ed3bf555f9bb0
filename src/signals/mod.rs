//! 自适应控制信号：重复 / 停滞检测与置信度评估

pub mod confidence;
pub mod repetition;

pub use confidence::{ConfidenceAssessor, ConfidenceTier, Outcome, Strategy};
pub use repetition::{
    extract_request_params, ErrorCategory, RepetitionDetector, RepetitionPattern,
    RequestFingerprint, RequestRecord, ResponseSignature,
};
