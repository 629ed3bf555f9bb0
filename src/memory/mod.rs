//! 记忆层：转写（短期）、动作历史（中期）、持久事实与上下文压缩

pub mod compressor;
pub mod discoveries;
pub mod transcript;
pub mod working;

pub use compressor::{Compression, ContextCompressor};
pub use discoveries::{Discovery, DiscoveryStore};
pub use transcript::{ActionRequest, ActionResult, TranscriptEntry, SUBMIT_TOOL};
pub use working::{ActionHistory, ActionRecord};
